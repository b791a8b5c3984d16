//! Login status decoding (RFC 3720 Section 10.13.5)

use iscsi_initiator::error::decode_login_status;

fn decoded(status: u16) -> String {
    decode_login_status((status >> 8) as u8, status as u8)
}

#[test]
fn test_success_is_not_an_error() {
    let msg = decoded(0x0000);
    assert!(msg.contains("success"));
    assert!(msg.ends_with("(status 0x0000)"));
}

#[test]
fn test_redirects_point_at_target_address() {
    for status in [0x0101, 0x0102] {
        let msg = decoded(status);
        assert!(msg.contains("TargetAddress"), "{}", msg);
    }
    assert!(decoded(0x0101).contains("temporarily"));
    assert!(decoded(0x0102).contains("permanently"));
}

#[test]
fn test_authentication_and_authorization_are_distinguished() {
    let auth = decoded(0x0201);
    let acl = decoded(0x0202);
    assert!(auth.contains("CHAP"), "{}", auth);
    assert!(acl.contains("ACL"), "{}", acl);
    assert_ne!(auth, acl);
}

#[test]
fn test_target_not_found_suggests_discovery() {
    let msg = decoded(0x0203);
    assert!(msg.contains("Target not found"));
    assert!(msg.contains("discovery"));
}

#[test]
fn test_session_type_hint() {
    assert!(decoded(0x0209).contains("SendTargets"));
    assert!(decoded(0x0207).contains("TargetName"));
}

#[test]
fn test_target_side_failures() {
    assert!(decoded(0x0300).starts_with("Target error"));
    assert!(decoded(0x0301).contains("retry"));
    assert!(decoded(0x0302).contains("resources"));
}

#[test]
fn test_unknown_code_shows_raw_value() {
    let msg = decode_login_status(0x04, 0x7f);
    assert!(msg.starts_with("Unknown login status 0x047f"));
    assert!(msg.contains("RFC 3720"));
}

#[test]
fn test_every_defined_code_has_a_message() {
    let defined: &[u16] = &[
        0x0000, 0x0101, 0x0102, 0x0200, 0x0201, 0x0202, 0x0203, 0x0204, 0x0205, 0x0206, 0x0207, 0x0208, 0x0209,
        0x020a, 0x020b, 0x0300, 0x0301, 0x0302,
    ];
    for &status in defined {
        let msg = decoded(status);
        assert!(!msg.starts_with("Unknown"), "0x{:04x} decoded as {}", status, msg);
        assert!(msg.contains(&format!("0x{:04x}", status)), "{}", msg);
    }
}
