//! Connect routing through the local table, the global table and the
//! transport, plus disconnect.

use session_layer::{
    AppEvent, AppFlags, AppOptions, ConnectArgs, ConnectScope, DetachArgs, DisconnectArgs, Dispatched, ListenArgs,
    ListenerIndex, NamespaceIndex, SessionEndpoint, SessionError, SessionKind, SessionRule, TransportProto,
    OWNER_THREAD_INDEX,
};

use crate::harness::{drain, ip, tcp, Harness, TRANSPORT_THREAD};

#[test]
fn test_local_rendezvous_skips_transport() {
    let mut h = Harness::new();
    let mut a = h.attach("a");
    let b = h.attach("b");
    let mut c = h.attach("c");

    let h1 = h
        .layer
        .listen(ListenArgs::new(a.app, tcp(10, 0, 0, 1, 80)))
        .expect("A binds");
    assert_eq!(
        h.layer.listen(ListenArgs::new(b.app, tcp(10, 0, 0, 1, 80))).err(),
        Some(SessionError::AddressInUse)
    );

    let connected = h
        .layer
        .connect(ConnectArgs::new(c.app, tcp(10, 0, 0, 1, 80)).with_context(42))
        .expect("C connects");
    assert_eq!(connected.scope, ConnectScope::Local);
    assert_eq!(connected.handle.thread_index(), OWNER_THREAD_INDEX);
    assert_ne!(connected.handle.as_u64(), h1.as_u64());
    assert_eq!(h.transport.connect_count(), 0);

    let session = h.layer.session_pools().snapshot(connected.handle).expect("session");
    let SessionKind::Local(local) = session.kind else {
        panic!("expected a local session, got {:?}", session.kind);
    };
    assert_eq!(local.client_app, c.app);
    assert_eq!(local.server_app, a.app);
    assert_eq!(local.api_context, 42);

    assert_eq!(
        drain(&mut a.worker.events),
        vec![AppEvent::Accepted {
            listener: h1,
            session: connected.handle,
            client: c.app,
        }]
    );
    assert!(drain(&mut c.worker.events).is_empty());
    assert_eq!(
        h.layer
            .apps()
            .worker(c.worker.wrk_index)
            .map(|worker| worker.local_sessions().collect::<Vec<_>>()),
        Some(vec![connected.handle])
    );
}

#[test]
fn test_own_listener_falls_through_to_global_scope() {
    let mut h = Harness::new();
    let a = h.attach("a");
    h.layer
        .listen(ListenArgs::new(a.app, tcp(10, 0, 0, 1, 80)))
        .expect("listen");

    let connected = h
        .layer
        .connect(ConnectArgs::new(a.app, tcp(10, 0, 0, 1, 80)))
        .expect("self connect");
    assert_eq!(connected.scope, ConnectScope::Global);
    assert_eq!(h.transport.connect_count(), 0);
}

#[test]
fn test_own_loopback_listener_is_never_a_local_match() {
    let mut h = Harness::new();
    let a = h.attach("a");
    h.layer
        .listen(ListenArgs::new(a.app, tcp(127, 0, 0, 1, 7000)))
        .expect("listen");

    assert_eq!(
        h.layer.connect(ConnectArgs::new(a.app, tcp(127, 0, 0, 1, 7000))).err(),
        Some(SessionError::SessionConnectLocalOnly)
    );

    let b = h.attach("b");
    let connected = h
        .layer
        .connect(ConnectArgs::new(b.app, tcp(127, 0, 0, 1, 7000)))
        .expect("other app connects");
    assert_eq!(connected.scope, ConnectScope::Local);
}

#[test]
fn test_unmatched_connect_goes_to_transport() {
    let mut h = Harness::new();
    let mut c = h.attach("c");

    let connected = h
        .layer
        .connect(ConnectArgs::new(c.app, tcp(8, 8, 8, 8, 443)).with_context(7))
        .expect("connect");
    assert_eq!(connected.scope, ConnectScope::Transport);
    assert_eq!(connected.handle.thread_index(), TRANSPORT_THREAD);

    let connects = h.transport.connects.lock().clone();
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].app, c.app);
    assert_eq!(connects[0].wrk, c.worker.wrk_index);
    assert_eq!(connects[0].api_context, 7);
    assert_eq!(connects[0].endpoint.fib_index, Some(0));
    assert_eq!(
        h.layer
            .apps()
            .worker(c.worker.wrk_index)
            .map(|worker| worker.connects().collect::<Vec<_>>()),
        Some(vec![connected.handle])
    );
    // The transport reports completion through its own channel.
    assert!(drain(&mut c.worker.events).is_empty());
}

#[test]
fn test_deny_rule_filters_before_any_listener() {
    let mut h = Harness::new();
    let a = h.attach("a");
    let c = h.attach("c");
    h.layer
        .listen(ListenArgs::new(a.app, tcp(10, 0, 0, 1, 80)))
        .expect("listen");
    h.layer
        .add_session_rule(NamespaceIndex::DEFAULT, SessionRule::deny(TransportProto::Tcp, ip(10, 0, 0, 0), 8))
        .expect("rule");

    assert_eq!(
        h.layer.connect(ConnectArgs::new(c.app, tcp(10, 0, 0, 1, 80))).err(),
        Some(SessionError::ConnectFiltered)
    );
    assert_eq!(
        h.layer.connect(ConnectArgs::new(c.app, tcp(10, 200, 0, 1, 22))).err(),
        Some(SessionError::ConnectFiltered)
    );
    assert_eq!(h.transport.connect_count(), 0);

    // Outside the prefix the normal path applies.
    let connected = h
        .layer
        .connect(ConnectArgs::new(c.app, tcp(11, 0, 0, 1, 80)))
        .expect("outside prefix");
    assert_eq!(connected.scope, ConnectScope::Transport);
}

#[test]
fn test_forward_rule_redirects_to_listener() {
    let mut h = Harness::new();
    let mut a = h.attach("a");
    let c = h.attach("c");
    let listener = h
        .layer
        .listen(ListenArgs::new(a.app, tcp(10, 0, 0, 1, 8080)))
        .expect("listen");
    h.layer
        .add_session_rule(
            NamespaceIndex::DEFAULT,
            SessionRule::forward(
                TransportProto::Tcp,
                ip(172, 16, 0, 0),
                12,
                ListenerIndex::from_handle(listener),
            )
            .on_port(80),
        )
        .expect("rule");

    let connected = h
        .layer
        .connect(ConnectArgs::new(c.app, tcp(172, 16, 4, 4, 80)))
        .expect("forwarded");
    assert_eq!(connected.scope, ConnectScope::Local);
    assert_eq!(h.transport.connect_count(), 0);
    assert!(matches!(
        drain(&mut a.worker.events).as_slice(),
        [AppEvent::Accepted { client, .. }] if *client == c.app
    ));
}

#[test]
fn test_rule_in_unknown_namespace_is_rejected() {
    let mut h = Harness::new();
    assert_eq!(
        h.layer
            .add_session_rule(NamespaceIndex(9), SessionRule::deny(TransportProto::Tcp, ip(10, 0, 0, 0), 8))
            .err(),
        Some(SessionError::InvalidNamespace)
    );
}

#[test]
fn test_local_only_app_cannot_reach_global_scope() {
    let mut h = Harness::new();
    let a = h.attach("a");
    let local = h.attach_with("local", AppOptions::default().with_flags(AppFlags::USE_LOCAL_SCOPE));
    h.layer
        .listen(ListenArgs::new(a.app, tcp(10, 0, 0, 1, 80)))
        .expect("listen");

    // The local table still serves it.
    let connected = h
        .layer
        .connect(ConnectArgs::new(local.app, tcp(10, 0, 0, 1, 80)))
        .expect("local connect");
    assert_eq!(connected.scope, ConnectScope::Local);

    assert_eq!(
        h.layer.connect(ConnectArgs::new(local.app, tcp(8, 8, 8, 8, 53))).err(),
        Some(SessionError::ConnectScopeDenied)
    );
    assert_eq!(h.transport.connect_count(), 0);
}

#[test]
fn test_global_only_app_skips_local_table() {
    let mut h = Harness::new();
    let a = h.attach("a");
    let global = h.attach_with("global", AppOptions::default().with_flags(AppFlags::USE_GLOBAL_SCOPE));
    h.layer
        .listen(ListenArgs::new(a.app, tcp(10, 0, 0, 1, 80)))
        .expect("listen");

    let connected = h
        .layer
        .connect(ConnectArgs::new(global.app, tcp(10, 0, 0, 1, 80)))
        .expect("connect");
    assert_eq!(connected.scope, ConnectScope::Global);
}

#[test]
fn test_loopback_without_listener_is_local_only() {
    let mut h = Harness::new();
    let c = h.attach("c");
    assert_eq!(
        h.layer.connect(ConnectArgs::new(c.app, tcp(127, 0, 0, 1, 80))).err(),
        Some(SessionError::SessionConnectLocalOnly)
    );
    assert_eq!(h.transport.connect_count(), 0);
}

#[test]
fn test_unspecified_destination_is_invalid() {
    let mut h = Harness::new();
    let c = h.attach("c");
    assert!(matches!(
        h.layer.connect(ConnectArgs::new(c.app, SessionEndpoint::unspecified(TransportProto::Tcp))),
        Err(SessionError::InvalidValue { .. })
    ));
}

#[test]
fn test_transport_refusal_surfaces_as_connect_failure() {
    let mut h = Harness::new();
    let c = h.attach("c");
    h.transport.refuse_connects(true);

    assert!(matches!(
        h.layer.connect(ConnectArgs::new(c.app, tcp(8, 8, 8, 8, 443))),
        Err(SessionError::SessionConnectFailed { .. })
    ));
    assert_eq!(
        h.layer.apps().worker(c.worker.wrk_index).map(|worker| worker.connects().count()),
        Some(0)
    );
}

#[test]
fn test_local_sessions_round_robin_across_listener_workers() {
    let mut h = Harness::new();
    let mut server = h.attach("server");
    let mut second = h.layer.add_worker(server.app, None).expect("second worker");
    let client = h.attach("client");

    h.layer
        .listen(ListenArgs::new(server.app, tcp(10, 0, 0, 1, 80)))
        .expect("listen");
    h.layer
        .listen(ListenArgs::new(server.app, tcp(10, 0, 0, 1, 80)).for_worker(1))
        .expect("join");

    for _ in 0..4 {
        h.layer
            .connect(ConnectArgs::new(client.app, tcp(10, 0, 0, 1, 80)))
            .expect("connect");
    }
    assert_eq!(drain(&mut server.worker.events).len(), 2);
    assert_eq!(drain(&mut second.events).len(), 2);
}

#[test]
fn test_disconnect_local_session_notifies_both_sides() {
    let mut h = Harness::new();
    let mut a = h.attach("a");
    let mut c = h.attach("c");
    let stranger = h.attach("stranger");
    h.layer
        .listen(ListenArgs::new(a.app, tcp(10, 0, 0, 1, 80)))
        .expect("listen");
    let connected = h
        .layer
        .connect(ConnectArgs::new(c.app, tcp(10, 0, 0, 1, 80)))
        .expect("connect");
    drain(&mut a.worker.events);

    assert_eq!(
        h.layer
            .disconnect(DisconnectArgs {
                app: stranger.app,
                handle: connected.handle,
            })
            .err(),
        Some(SessionError::NotOwner)
    );

    let outcome = h
        .layer
        .disconnect(DisconnectArgs {
            app: c.app,
            handle: connected.handle,
        })
        .expect("disconnect");
    assert_eq!(outcome, Dispatched::Completed(()));
    let closed = AppEvent::Disconnected {
        session: connected.handle,
    };
    assert_eq!(drain(&mut a.worker.events), vec![closed.clone()]);
    assert_eq!(drain(&mut c.worker.events), vec![closed]);
    assert!(!h.layer.session_pools().is_live(connected.handle));

    // A second disconnect of the same session is a no-op.
    h.layer
        .disconnect(DisconnectArgs {
            app: c.app,
            handle: connected.handle,
        })
        .expect("repeat disconnect");
}

#[test]
fn test_disconnect_transport_session() {
    let mut h = Harness::new();
    let c = h.attach("c");
    let other = h.attach("other");
    let connected = h
        .layer
        .connect(ConnectArgs::new(c.app, tcp(8, 8, 8, 8, 443)))
        .expect("connect");

    assert!(matches!(
        h.layer.disconnect(DisconnectArgs {
            app: other.app,
            handle: connected.handle,
        }),
        Err(SessionError::InvalidValue { .. })
    ));

    h.layer
        .disconnect(DisconnectArgs {
            app: c.app,
            handle: connected.handle,
        })
        .expect("disconnect");
    assert_eq!(*h.transport.closes.lock(), vec![connected.handle]);
    assert_eq!(h.layer.session_pools().session_count(TRANSPORT_THREAD), 0);
    assert_eq!(
        h.layer.apps().worker(c.worker.wrk_index).map(|worker| worker.connects().count()),
        Some(0)
    );
}

#[test]
fn test_listener_session_cannot_be_disconnected() {
    let mut h = Harness::new();
    let a = h.attach("a");
    let handle = h
        .layer
        .listen(ListenArgs::new(a.app, tcp(10, 0, 0, 1, 80)))
        .expect("listen");
    let session = h
        .layer
        .listeners()
        .get(ListenerIndex::from_handle(handle))
        .and_then(|listener| listener.session)
        .expect("listener session");

    assert!(matches!(
        h.layer.disconnect(DisconnectArgs { app: a.app, handle: session }),
        Err(SessionError::InvalidValue { .. })
    ));
}

#[test]
fn test_detach_closes_sessions_on_both_ends() {
    let mut h = Harness::new();
    let mut a = h.attach("a");
    let c = h.attach("c");
    h.layer
        .listen(ListenArgs::new(a.app, tcp(10, 0, 0, 1, 80)))
        .expect("listen");
    let local = h
        .layer
        .connect(ConnectArgs::new(c.app, tcp(10, 0, 0, 1, 80)))
        .expect("local connect");
    let remote = h
        .layer
        .connect(ConnectArgs::new(c.app, tcp(8, 8, 8, 8, 443)))
        .expect("transport connect");
    drain(&mut a.worker.events);

    h.layer
        .detach(DetachArgs::all(c.app))
        .expect("detach");

    assert!(!h.layer.session_pools().is_live(local.handle));
    assert_eq!(*h.transport.closes.lock(), vec![remote.handle]);
    assert_eq!(
        drain(&mut a.worker.events),
        vec![AppEvent::Disconnected { session: local.handle }]
    );
}
