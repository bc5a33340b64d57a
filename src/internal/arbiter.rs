use crate::{ParticipantId, Role, SessionError};

/// decides which side creates the offer. the larger id initiates.
///
/// for any two distinct ids exactly one side concludes `Initiator`, so both
/// peers reach complementary roles without talking to each other first.
pub fn decide(local: &ParticipantId, remote: &ParticipantId) -> Result<Role, SessionError> {
    if local == remote {
        return Err(SessionError::IdentityCollision(local.clone()));
    }
    if local > remote {
        Ok(Role::Initiator)
    } else {
        Ok(Role::Responder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn larger_id_initiates() {
        assert_eq!(decide(&"zzz".into(), &"aaa".into()).unwrap(), Role::Initiator);
        assert_eq!(decide(&"aaa".into(), &"zzz".into()).unwrap(), Role::Responder);
    }

    #[test]
    fn collision_fails_fast() {
        let id = ParticipantId::from("same");
        assert!(matches!(
            decide(&id, &id),
            Err(SessionError::IdentityCollision(_))
        ));
    }
}
