//! Tests for message types and identifiers.

use super::*;

mod entity_name_tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(EntityName::new("orders".to_string()).is_ok());
        assert!(EntityName::new("orders-dlq_2".to_string()).is_ok());
        assert!(EntityName::new("events/sub-a".to_string()).is_ok());
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(EntityName::new(String::new()).is_err());
    }

    #[test]
    fn test_invalid_characters_rejected() {
        assert!(EntityName::new("orders queue".to_string()).is_err());
        assert!(EntityName::new("orders!".to_string()).is_err());
    }

    #[test]
    fn test_overlong_name_rejected() {
        let name = "a".repeat(261);
        assert!(EntityName::new(name).is_err());
    }
}

mod session_id_tests {
    use super::*;

    #[test]
    fn test_valid_session_id() {
        let id = SessionId::new("order-123".to_string()).unwrap();
        assert_eq!(id.as_str(), "order-123");
    }

    #[test]
    fn test_empty_session_id_rejected() {
        assert!(SessionId::new(String::new()).is_err());
    }

    #[test]
    fn test_overlong_session_id_rejected() {
        assert!(SessionId::new("x".repeat(129)).is_err());
    }

    #[test]
    fn test_control_characters_rejected() {
        assert!(SessionId::new("bad\nid".to_string()).is_err());
    }

    #[test]
    fn test_from_str() {
        let id: SessionId = "s1".parse().unwrap();
        assert_eq!(id.as_str(), "s1");
    }
}

mod lock_token_tests {
    use super::*;

    #[test]
    fn test_minted_tokens_are_unique() {
        let a = LockToken::mint();
        let b = LockToken::mint();
        assert_ne!(a, b);
    }

    #[test]
    fn test_token_is_copyable_and_comparable() {
        let a = LockToken::mint();
        let b = a;
        assert_eq!(a, b);
    }
}

mod message_tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_message_builder() {
        let session_id = SessionId::new("s1".to_string()).unwrap();
        let message = Message::new(Bytes::from("payload"))
            .with_session_id(session_id.clone())
            .with_property("kind".to_string(), "order".to_string());

        assert_eq!(message.body, Bytes::from("payload"));
        assert_eq!(message.session_id, Some(session_id));
        assert_eq!(
            message.application_properties.get("kind"),
            Some(&"order".to_string())
        );
    }

    #[test]
    fn test_message_body_serde_round_trip() {
        let message = Message::new(Bytes::from(vec![0u8, 159, 146, 150]))
            .with_property("k".to_string(), "v".to_string());

        let json = serde_json::to_string(&message).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();

        assert_eq!(back.body, message.body);
        assert_eq!(back.application_properties, message.application_properties);
        assert_eq!(back.session_id, None);
    }

    #[test]
    fn test_received_message_converts_back() {
        let received = ReceivedMessage {
            sequence_number: 4,
            body: Bytes::from("payload"),
            application_properties: HashMap::new(),
            session_id: SessionId::new("s1".to_string()).ok(),
            enqueued_at: Utc::now(),
            delivery_count: 1,
            lock_token: Some(LockToken::mint()),
            locked_until: Some(Utc::now()),
        };

        let message = received.message();
        assert_eq!(message.body, received.body);
        assert_eq!(message.session_id, received.session_id);
    }
}
