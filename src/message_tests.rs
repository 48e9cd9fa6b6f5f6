//! Tests for message types and the wire codec.

use super::*;

// ============================================================================
// Entity Name Validation
// ============================================================================

mod entity_names {
    use super::*;

    /// Verify that well-formed names are accepted.
    #[test]
    fn test_valid_entity_names() {
        assert!(EntityName::new("orders".to_string()).is_ok());
        assert!(EntityName::new("order-placed".to_string()).is_ok());
        assert!(EntityName::new("order_placed_v2".to_string()).is_ok());
    }

    /// Verify length restrictions.
    #[test]
    fn test_entity_name_length_limits() {
        assert!(EntityName::new(String::new()).is_err());
        assert!(EntityName::new("a".repeat(261)).is_err());
        assert!(EntityName::new("a".repeat(260)).is_ok());
    }

    /// Verify character restrictions.
    #[test]
    fn test_entity_name_invalid_characters() {
        assert!(EntityName::new("orders queue".to_string()).is_err());
        assert!(EntityName::new("orders/queue".to_string()).is_err());
        assert!(EntityName::new("ordérs".to_string()).is_err());
    }

    /// Verify hyphen placement rules.
    #[test]
    fn test_entity_name_hyphen_rules() {
        assert!(EntityName::new("-orders".to_string()).is_err());
        assert!(EntityName::new("orders-".to_string()).is_err());
        assert!(EntityName::new("or--ders".to_string()).is_err());
    }

    /// Verify derivation from a fully qualified type label.
    #[test]
    fn test_for_type_label_derivation() {
        let name = EntityName::for_type_label("my_app::events::OrderPlaced", None).unwrap();
        assert_eq!(name.as_str(), "order-placed");
    }

    /// Verify that generic parameters are stripped before derivation.
    #[test]
    fn test_for_type_label_strips_generics() {
        let name = EntityName::for_type_label("my_app::Wrapper<my_app::Inner>", None).unwrap();
        assert_eq!(name.as_str(), "wrapper");
    }

    /// Verify that a configured prefix is prepended.
    #[test]
    fn test_for_type_label_with_prefix() {
        let name = EntityName::for_type_label("my_app::OrderPlaced", Some("staging")).unwrap();
        assert_eq!(name.as_str(), "staging-order-placed");
    }

    /// Verify that snake_case labels survive derivation.
    #[test]
    fn test_for_type_label_snake_case() {
        let name = EntityName::for_type_label("my_app::order_snapshot", None).unwrap();
        assert_eq!(name.as_str(), "order_snapshot");
    }
}

// ============================================================================
// Delivery Tokens and Receipts
// ============================================================================

mod tokens_and_receipts {
    use super::*;

    /// Verify that tokens are unique.
    #[test]
    fn test_delivery_tokens_are_unique() {
        let a = DeliveryToken::new();
        let b = DeliveryToken::new();
        assert_ne!(a, b);
    }

    /// Verify receipt expiry detection.
    #[test]
    fn test_receipt_handle_expiry() {
        let expired = ReceiptHandle::new(
            "r1".to_string(),
            "orders".to_string(),
            Timestamp::from_datetime(chrono::Utc::now() - Duration::seconds(1)),
        );
        assert!(expired.is_expired());
        assert_eq!(expired.time_until_expiry(), Duration::zero());

        let live = ReceiptHandle::new(
            "r2".to_string(),
            "orders".to_string(),
            Timestamp::from_datetime(chrono::Utc::now() + Duration::seconds(30)),
        );
        assert!(!live.is_expired());
        assert!(live.time_until_expiry() > Duration::seconds(25));
    }

    /// Verify receipt accessors.
    #[test]
    fn test_receipt_handle_accessors() {
        let receipt = ReceiptHandle::new(
            "handle-1".to_string(),
            "orders".to_string(),
            Timestamp::now(),
        );
        assert_eq!(receipt.handle(), "handle-1");
        assert_eq!(receipt.entity(), "orders");
    }
}

// ============================================================================
// Wire Codec
// ============================================================================

mod codec {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: String,
        amount_cents: u64,
        items: Vec<String>,
    }

    fn sample() -> OrderPlaced {
        OrderPlaced {
            order_id: "ord-42".to_string(),
            amount_cents: 1999,
            items: vec!["widget".to_string(), "gadget".to_string()],
        }
    }

    /// Verify the round-trip law: decode(encode(m)) == m field for field.
    #[test]
    fn test_round_trip_law() {
        let message = sample();
        let payload = encode(&message).unwrap();
        let decoded: OrderPlaced = decode(&payload).unwrap();
        assert_eq!(decoded, message);
    }

    /// Verify the payload is tagged with the JSON content type and the
    /// fully qualified type label.
    #[test]
    fn test_payload_tagging() {
        let payload = encode(&sample()).unwrap();
        assert_eq!(payload.content_type, CONTENT_TYPE_JSON);
        assert!(payload.label.ends_with("OrderPlaced"));
    }

    /// Verify that a foreign content type is rejected.
    #[test]
    fn test_decode_rejects_foreign_content_type() {
        let mut payload = encode(&sample()).unwrap();
        payload.content_type = "application/xml".to_string();
        let result: Result<OrderPlaced, _> = decode(&payload);
        assert!(matches!(
            result,
            Err(SerializationError::UnsupportedContentType { .. })
        ));
    }

    /// Verify that malformed bodies fail with a JSON error.
    #[test]
    fn test_decode_rejects_malformed_body() {
        let payload = WirePayload {
            body: Bytes::from_static(b"not json"),
            content_type: CONTENT_TYPE_JSON.to_string(),
            label: "whatever".to_string(),
        };
        let result: Result<OrderPlaced, _> = decode(&payload);
        assert!(matches!(result, Err(SerializationError::JsonError(_))));
    }

    /// Verify that WirePayload itself serializes (bodies as base64).
    #[test]
    fn test_wire_payload_serde_round_trip() {
        let payload = encode(&sample()).unwrap();
        let json = serde_json::to_string(&payload).unwrap();
        let back: WirePayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
