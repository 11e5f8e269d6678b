//! Cross-cutting invariants that don't belong to any single capability
//! crate: the handle id floor and `CAPS_LIST` completeness across the whole
//! registered surface.

use zingcore_core::registry::OpenRequest;
use zingcore_core::syscall;
use zingcore_harness::{build_runtime, covers_expected, expected_descriptors};

#[test]
fn first_allocated_handle_is_at_the_reserved_floor() {
    let runtime = build_runtime().unwrap();
    let id = runtime.registry.open(&runtime, &OpenRequest { kind: "sys", name: "loop", version: 1, params: &[] }).unwrap();
    assert_eq!(id, zingcore_core::handle::FIRST_ID);
}

#[test]
fn caps_list_reflects_every_registered_capability() {
    let runtime = build_runtime().unwrap();

    let mut req = [0_u8; 24];
    zingcore_wire::write_ok(&mut req, syscall::CTL_OP_CAPS_LIST, 1, &[]).unwrap();
    let mut resp = [0_u8; 4096];
    let n = syscall::ctl(&runtime, &req, &mut resp).unwrap();
    let parsed = zingcore_wire::parse(&resp[..n]).unwrap();
    assert!(parsed.header.is_ok());

    assert_eq!(runtime.registry.count(), expected_descriptors().len());
    assert!(covers_expected(&runtime.registry.list()));
}

#[test]
fn opening_an_unregistered_capability_is_noent() {
    let runtime = build_runtime().unwrap();
    let err = runtime
        .registry
        .open(&runtime, &OpenRequest { kind: "does", name: "not-exist", version: 1, params: &[] })
        .unwrap_err();
    assert!(matches!(err, zingcore_core::CoreError::Noent(_)));
}
