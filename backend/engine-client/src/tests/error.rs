use crate::EngineError;

/// **VALUE**: Verifies that the companion app's expiry error is classified by name.
///
/// **WHY THIS MATTERS**: The router's single retry keys off `is_session_expired()`. If the
/// structured error is passed through as a generic business error, expired desktop sessions
/// fail permanently instead of being transparently re-created.
///
/// **BUG THIS CATCHES**: Would catch a typo in the expiry error name or classification by
/// message text instead of by name.
#[test]
fn given_desktop_session_expired_payload_when_classified_then_is_session_expired() {
    // GIVEN: The structured payload the engine uses for an expired session
    let payload = br#"{"name":"DesktopSessionExpired","message":"session expired"}"#;

    // WHEN: Classifying it
    let error = EngineError::from_engine_payload(payload);

    // THEN: It is the recoverable variant, and nothing else
    assert!(error.is_session_expired());
    assert!(!error.is_invalid_session());
    assert_eq!(error.error_category(), "session_expired");
}

/// **VALUE**: Verifies that other structured errors keep their engine-provided name.
///
/// **WHY THIS MATTERS**: Callers branch on engine error names (e.g. a missing item versus a
/// bad reference). Dropping the name would force them to parse messages.
///
/// **BUG THIS CATCHES**: Would catch the name being discarded during classification.
#[test]
fn given_named_engine_error_when_classified_then_name_and_message_are_kept() {
    // GIVEN: A structured business error
    let payload = br#"{"name":"InvalidUserInput","message":"secret reference is not prefixed with op://"}"#;

    // WHEN: Classifying it
    let error = EngineError::from_engine_payload(payload);

    // THEN: The name and message survive verbatim
    match error {
        EngineError::Engine { name, message, .. } => {
            assert_eq!(name.as_deref(), Some("InvalidUserInput"));
            assert_eq!(message, "secret reference is not prefixed with op://");
        }
        other => panic!("expected an engine error, got {other:?}"),
    }
}

/// **VALUE**: Verifies that non-JSON error payloads pass through as plain text.
///
/// **WHY THIS MATTERS**: Older engines report plain strings. Those must reach the caller
/// intact rather than being replaced by a JSON parse failure.
///
/// **BUG THIS CATCHES**: Would catch a strict JSON decode that turns business errors into
/// serialization errors.
#[test]
fn given_plain_text_payload_when_classified_then_passed_through_verbatim() {
    // GIVEN: A plain-text error
    let payload = b"invalid service account token";

    // WHEN: Classifying it
    let error = EngineError::from_engine_payload(payload);

    // THEN: It is an unnamed business error with the exact text
    match &error {
        EngineError::Engine { name, message, .. } => {
            assert!(name.is_none());
            assert_eq!(message, "invalid service account token");
        }
        other => panic!("expected an engine error, got {other:?}"),
    }
    assert!(format!("{error}").starts_with("Engine Error: invalid service account token"));
}

/// **VALUE**: Verifies that errors render with the caller's location.
///
/// **WHY THIS MATTERS**: Transport failures can originate in any of three backends; the
/// location suffix tells a reader which call site produced them.
///
/// **BUG THIS CATCHES**: Would catch `#[track_caller]` being removed from the constructors,
/// which would make every error point at the error module itself.
#[test]
fn given_transport_error_when_formatted_then_includes_caller_location() {
    // GIVEN: A transport error built here
    let error = EngineError::transport("socket closed");

    // WHEN: Formatting it
    let rendered = format!("{error}");

    // THEN: The kind, message and this file are all present
    assert!(rendered.contains("Transport Error: socket closed"));
    assert!(rendered.contains("tests/error.rs"));
}

/// **VALUE**: Verifies the oversized-message error carries sizes and the support hint.
///
/// **WHY THIS MATTERS**: Users hitting the ceiling need to know the limit and where to get
/// help; the engine never sees these requests so this text is all they get.
///
/// **BUG THIS CATCHES**: Would catch the limit being dropped from the message.
#[test]
fn given_message_too_large_when_formatted_then_mentions_limit() {
    // GIVEN: An oversized message error
    let error = EngineError::message_too_large(60, 50);

    // WHEN: Formatting it
    let rendered = format!("{error}");

    // THEN: Both sizes and the support hint appear
    assert!(rendered.contains("60 bytes exceeds the limit of 50 bytes"));
    assert!(rendered.contains("support@1password.com"));
    assert_eq!(error.error_category(), "message_too_large");
}
