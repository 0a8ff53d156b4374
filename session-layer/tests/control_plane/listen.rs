//! Bind/unbind: key dedup, worker attachment and table registration.

use session_layer::{
    AppFlags, AppOptions, DetachArgs, ListenArgs, ListenerIndex, NamespaceConfig, NamespaceIndex, SessionError,
    SessionLayerConfig, SessionState, UnlistenArgs, OWNER_THREAD_INDEX,
};

use crate::harness::{tcp, Harness};

#[test]
fn test_listen_registers_in_both_scopes() {
    let mut h = Harness::new();
    let server = h.attach("server");

    let handle = h
        .layer
        .listen(ListenArgs::new(server.app, tcp(10, 0, 0, 1, 80)))
        .expect("listen");

    let listener = h
        .layer
        .listeners()
        .get(ListenerIndex::from_handle(handle))
        .expect("listener");
    assert!(listener.in_local);
    assert!(listener.in_global);
    assert_eq!(listener.endpoint.fib_index, Some(0));
    assert_eq!(listener.worker_count(), 1);

    let session = listener.session.expect("listener session");
    assert_eq!(session.thread_index(), OWNER_THREAD_INDEX);
    let snapshot = h.layer.session_pools().snapshot(session).expect("session");
    assert_eq!(snapshot.state, SessionState::Listening);

    assert_eq!(h.transport.listens.lock().len(), 1);
    assert_eq!(
        h.layer.lookup().lookup_global_exact(0, &tcp(10, 0, 0, 1, 80)),
        Some(ListenerIndex::from_handle(handle))
    );
}

#[test]
fn test_second_worker_joins_existing_listener() {
    let mut h = Harness::new();
    let server = h.attach("server");
    h.layer.add_worker(server.app, None).expect("second worker");

    let first = h
        .layer
        .listen(ListenArgs::new(server.app, tcp(10, 0, 0, 1, 80)))
        .expect("listen");
    let second = h
        .layer
        .listen(ListenArgs::new(server.app, tcp(10, 0, 0, 1, 80)).for_worker(1))
        .expect("listen again");
    // Binding again from a worker already on the listener changes nothing.
    let again = h
        .layer
        .listen(ListenArgs::new(server.app, tcp(10, 0, 0, 1, 80)))
        .expect("idempotent listen");

    assert_eq!(first, second);
    assert_eq!(first, again);
    assert_eq!(h.layer.listeners().len(), 1);
    let listener = h
        .layer
        .listeners()
        .get(ListenerIndex::from_handle(first))
        .expect("listener");
    assert_eq!(listener.worker_count(), 2);
    assert_eq!(h.transport.listens.lock().len(), 1);
}

#[test]
fn test_other_app_gets_address_in_use() {
    let mut h = Harness::new();
    let a = h.attach("a");
    let b = h.attach("b");

    let held = h
        .layer
        .listen(ListenArgs::new(a.app, tcp(10, 0, 0, 1, 80)))
        .expect("listen");
    assert_eq!(
        h.layer.listen(ListenArgs::new(b.app, tcp(10, 0, 0, 1, 80))).err(),
        Some(SessionError::AddressInUse)
    );

    let listener = h
        .layer
        .listeners()
        .get(ListenerIndex::from_handle(held))
        .expect("listener survives");
    assert_eq!(listener.app_index, a.app);
    assert_eq!(listener.worker_count(), 1);

    // A different port is a different key.
    h.layer
        .listen(ListenArgs::new(b.app, tcp(10, 0, 0, 1, 81)))
        .expect("other port");
    assert_eq!(h.layer.listeners().len(), 2);
}

#[test]
fn test_bind_address_not_configured() {
    let mut h = Harness::new();
    let server = h.attach("server");
    assert_eq!(
        h.layer.listen(ListenArgs::new(server.app, tcp(10, 0, 0, 9, 80))).err(),
        Some(SessionError::InvalidNamespaceBind)
    );
    assert!(h.layer.listeners().is_empty());
    assert!(h.transport.listens.lock().is_empty());
}

#[test]
fn test_namespace_pins_interface_and_table() {
    let config = SessionLayerConfig::small()
        .with_namespace(NamespaceConfig::new("edge").with_sw_if_index(2).with_fibs(3, 3));
    let mut h = Harness::with_config(config);
    let edge = h.attach_with("edge-app", AppOptions::default().in_namespace("edge", None));

    // 10.0.0.1 lives on interface 1, not on the namespace's interface.
    assert_eq!(
        h.layer.listen(ListenArgs::new(edge.app, tcp(10, 0, 0, 1, 80))).err(),
        Some(SessionError::InvalidNamespaceBind)
    );

    let handle = h
        .layer
        .listen(ListenArgs::new(edge.app, tcp(192, 168, 1, 1, 80)))
        .expect("listen on namespace interface");
    let listener = h
        .layer
        .listeners()
        .get(ListenerIndex::from_handle(handle))
        .expect("listener");
    assert_eq!(listener.endpoint.fib_index, Some(3));
    assert_eq!(listener.endpoint.sw_if_index, Some(2));
    assert_ne!(listener.key.ns_index, NamespaceIndex::DEFAULT);
    assert_eq!(h.layer.lookup().lookup_global_exact(3, &tcp(192, 168, 1, 1, 80)), Some(listener.al_index));
}

#[test]
fn test_local_scope_only_listener_skips_transport() {
    let mut h = Harness::new();
    let local = h.attach_with("local", AppOptions::default().with_flags(AppFlags::USE_LOCAL_SCOPE));

    let handle = h
        .layer
        .listen(ListenArgs::new(local.app, tcp(127, 0, 0, 1, 7000)))
        .expect("loopback listen");
    let listener = h
        .layer
        .listeners()
        .get(ListenerIndex::from_handle(handle))
        .expect("listener");
    assert!(listener.in_local);
    assert!(!listener.in_global);
    assert!(listener.session.is_none());
    assert!(h.transport.listens.lock().is_empty());
    assert_eq!(h.layer.session_pools().session_count(OWNER_THREAD_INDEX), 0);
}

#[test]
fn test_unlisten_checks_owner_and_worker() {
    let mut h = Harness::new();
    let server = h.attach("server");
    let other = h.attach("other");
    h.layer.add_worker(server.app, None).expect("second worker");

    let handle = h
        .layer
        .listen(ListenArgs::new(server.app, tcp(10, 0, 0, 1, 80)))
        .expect("listen");

    assert_eq!(
        h.layer.unlisten(UnlistenArgs::new(other.app, handle)).err(),
        Some(SessionError::NotOwner)
    );
    // Worker 1 exists but never joined the listener.
    assert_eq!(
        h.layer.unlisten(UnlistenArgs::new(server.app, handle).for_worker(1)).err(),
        Some(SessionError::WorkerNotFound)
    );
    assert_eq!(h.layer.listeners().len(), 1);
}

#[test]
fn test_last_worker_out_destroys_listener() {
    let mut h = Harness::new();
    let server = h.attach("server");
    h.layer.add_worker(server.app, None).expect("second worker");

    let handle = h
        .layer
        .listen(ListenArgs::new(server.app, tcp(10, 0, 0, 1, 80)))
        .expect("listen");
    h.layer
        .listen(ListenArgs::new(server.app, tcp(10, 0, 0, 1, 80)).for_worker(1))
        .expect("join");

    h.layer
        .unlisten(UnlistenArgs::new(server.app, handle))
        .expect("first worker leaves");
    assert_eq!(h.layer.listeners().len(), 1);
    assert!(h.transport.unlistens.lock().is_empty());

    h.layer
        .unlisten(UnlistenArgs::new(server.app, handle).for_worker(1))
        .expect("last worker leaves");
    assert!(h.layer.listeners().is_empty());
    assert_eq!(h.transport.unlistens.lock().len(), 1);
    assert_eq!(h.layer.lookup().lookup_global_exact(0, &tcp(10, 0, 0, 1, 80)), None);
    assert_eq!(h.layer.session_pools().session_count(OWNER_THREAD_INDEX), 0);
    assert_eq!(
        h.layer.apps().app(server.app).map(|app| app.listeners().count()),
        Some(0)
    );

    assert_eq!(
        h.layer.unlisten(UnlistenArgs::new(server.app, handle)).err(),
        Some(SessionError::AddressNotInUse)
    );
}

#[test]
fn test_stale_handle_never_names_new_listener() {
    let mut h = Harness::new();
    let server = h.attach("server");

    let old = h
        .layer
        .listen(ListenArgs::new(server.app, tcp(10, 0, 0, 1, 80)))
        .expect("listen");
    h.layer
        .unlisten(UnlistenArgs::new(server.app, old))
        .expect("unlisten");
    let new = h
        .layer
        .listen(ListenArgs::new(server.app, tcp(10, 0, 0, 1, 80)))
        .expect("listen again");

    assert_ne!(old, new);
    assert_eq!(
        h.layer.unlisten(UnlistenArgs::new(server.app, old)).err(),
        Some(SessionError::AddressNotInUse)
    );
    assert_eq!(h.layer.listeners().len(), 1);
}

#[test]
fn test_detach_releases_listeners_for_other_apps() {
    let mut h = Harness::new();
    let a = h.attach("a");
    let b = h.attach("b");

    h.layer
        .listen(ListenArgs::new(a.app, tcp(10, 0, 0, 2, 443)))
        .expect("listen");
    h.layer
        .detach(DetachArgs::all(a.app))
        .expect("detach");

    assert!(h.layer.listeners().is_empty());
    h.layer
        .listen(ListenArgs::new(b.app, tcp(10, 0, 0, 2, 443)))
        .expect("address free again");
}

#[test]
fn test_listen_requires_attached_app_and_worker() {
    let mut h = Harness::new();
    let server = h.attach("server");

    assert!(matches!(
        h.layer.listen(ListenArgs::new(server.app, tcp(10, 0, 0, 1, 80)).for_worker(5)),
        Err(SessionError::InvalidValue2 { .. })
    ));

    h.layer
        .detach(DetachArgs::all(server.app))
        .expect("detach");
    assert_eq!(
        h.layer.listen(ListenArgs::new(server.app, tcp(10, 0, 0, 1, 80))).err(),
        Some(SessionError::ApplicationNotAttached)
    );
}
