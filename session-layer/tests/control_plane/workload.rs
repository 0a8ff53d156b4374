//! Seeded random workload checked against [`ControlPlaneModel`] after every
//! step.

use std::collections::BTreeSet;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use session_layer::{
    AppIndex, ConnectArgs, ConnectScope, DetachArgs, DisconnectArgs, Dispatched, ListenArgs, ListenerIndex,
    SessionEndpoint, SessionError, UnlistenArgs, WorkerAttachment, OWNER_THREAD_INDEX,
};

use crate::harness::{tcp, Harness, TRANSPORT_THREAD};
use crate::reference_model::{ControlPlaneModel, Expect};

const APPS: usize = 3;
const WORKERS_PER_APP: u32 = 2;

/// Listen endpoints, all configured on interface 1.
const ENDPOINTS: [(u8, u16); 6] = [(1, 80), (1, 81), (1, 443), (2, 80), (2, 53), (2, 8080)];

fn endpoint(slot: usize) -> SessionEndpoint {
    let (host, port) = ENDPOINTS[slot];
    tcp(10, 0, 0, host, port)
}

/// One step of the workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Listen { app: usize, worker: u32, endpoint: usize },
    Unlisten { app: usize, worker: u32, endpoint: usize },
    /// `None` connects to a remote address no listener can match.
    Connect { app: usize, endpoint: Option<usize> },
    Disconnect { position: usize },
}

#[derive(Debug, Clone)]
struct OpWeights {
    listen: u32,
    unlisten: u32,
    connect: u32,
    disconnect: u32,
}

impl Default for OpWeights {
    fn default() -> Self {
        Self {
            listen: 30,
            unlisten: 20,
            connect: 35,
            disconnect: 15,
        }
    }
}

impl OpWeights {
    /// Mostly binds and unbinds, to churn listener slots.
    fn listener_churn() -> Self {
        Self {
            listen: 45,
            unlisten: 40,
            connect: 10,
            disconnect: 5,
        }
    }

    fn total(&self) -> u32 {
        self.listen + self.unlisten + self.connect + self.disconnect
    }
}

fn pick_op(rng: &mut ChaCha8Rng, weights: &OpWeights, model: &ControlPlaneModel) -> Op {
    let app = rng.random_range(0..APPS);
    let worker = rng.random_range(0..WORKERS_PER_APP);
    let mut roll = rng.random_range(0..weights.total());

    if roll < weights.listen {
        return Op::Listen {
            app,
            worker,
            endpoint: rng.random_range(0..ENDPOINTS.len()),
        };
    }
    roll -= weights.listen;

    if roll < weights.unlisten {
        // Mostly target the app's own listeners so the success path runs.
        let owned: Vec<usize> = model.owned_by(app).collect();
        let endpoint = if !owned.is_empty() && rng.random_bool(0.8) {
            owned[rng.random_range(0..owned.len())]
        } else {
            rng.random_range(0..ENDPOINTS.len())
        };
        return Op::Unlisten { app, worker, endpoint };
    }
    roll -= weights.unlisten;

    if roll < weights.connect || model.sessions.is_empty() {
        let endpoint = rng
            .random_bool(0.85)
            .then(|| rng.random_range(0..ENDPOINTS.len()));
        return Op::Connect { app, endpoint };
    }

    Op::Disconnect {
        position: rng.random_range(0..model.sessions.len()),
    }
}

struct Workload {
    seed: u64,
    h: Harness,
    apps: Vec<AppIndex>,
    // Held so notifications always have a live receiver.
    _workers: Vec<WorkerAttachment>,
    model: ControlPlaneModel,
}

impl Workload {
    fn new(seed: u64) -> Self {
        let mut h = Harness::new();
        let mut apps = Vec::new();
        let mut workers = Vec::new();
        for slot in 0..APPS {
            let attached = h.attach(&format!("app{slot}"));
            for _ in 1..WORKERS_PER_APP {
                workers.push(h.layer.add_worker(attached.app, None).expect("add worker"));
            }
            apps.push(attached.app);
            workers.push(attached.worker);
        }
        Self {
            seed,
            h,
            apps,
            _workers: workers,
            model: ControlPlaneModel::new(),
        }
    }

    fn apply(&mut self, op: Op) {
        let seed = self.seed;
        match op {
            Op::Listen { app, worker, endpoint: slot } => {
                let expected = self.model.expect_listen(app, slot);
                let result = self
                    .h
                    .layer
                    .listen(ListenArgs::new(self.apps[app], endpoint(slot)).for_worker(worker));
                match (expected, result) {
                    (Expect::Ok(None), Ok(handle)) => self.model.record_listen(app, worker, slot, handle),
                    (Expect::Ok(Some(existing)), Ok(handle)) => {
                        assert_eq!(handle, existing, "seed {seed}: {op:?} returned another listener");
                        self.model.record_listen(app, worker, slot, handle);
                    }
                    (Expect::Err, Err(SessionError::AddressInUse)) => self.model.record_rejection("address in use"),
                    (expected, actual) => panic!("seed {seed}: {op:?} expected {expected:?}, got {actual:?}"),
                }
            }
            Op::Unlisten { app, worker, endpoint: slot } => {
                let Some(handle) = self.model.listeners.get(&slot).map(|listener| listener.handle) else {
                    return;
                };
                let expected = self.model.expect_unlisten(app, worker, slot);
                let result = self
                    .h
                    .layer
                    .unlisten(UnlistenArgs::new(self.apps[app], handle).for_worker(worker));
                match result {
                    Ok(()) if expected => self.model.record_unlisten(worker, slot),
                    Err(SessionError::NotOwner) | Err(SessionError::WorkerNotFound) if !expected => {
                        self.model.record_rejection("not on listener")
                    }
                    actual => panic!("seed {seed}: {op:?} expected success={expected}, got {actual:?}"),
                }
            }
            Op::Connect { app, endpoint: slot } => {
                let (target, expected) = match slot {
                    Some(slot) => (endpoint(slot), self.model.expect_connect(app, slot)),
                    None => (tcp(198, 51, 100, 7, 443), ConnectScope::Transport),
                };
                let connected = self
                    .h
                    .layer
                    .connect(ConnectArgs::new(self.apps[app], target))
                    .unwrap_or_else(|err| panic!("seed {seed}: {op:?} failed: {err}"));
                assert_eq!(connected.scope, expected, "seed {seed}: {op:?} served by the wrong tier");
                self.model.record_connect(app, connected.handle, connected.scope);
            }
            Op::Disconnect { position } => {
                let Some(session) = self.model.record_disconnect(position) else {
                    return;
                };
                let outcome = self.h.layer.disconnect(DisconnectArgs {
                    app: self.apps[session.client],
                    handle: session.handle,
                });
                assert_eq!(outcome, Ok(Dispatched::Completed(())), "seed {seed}: {op:?}");
                assert!(
                    !self.h.layer.session_pools().is_live(session.handle),
                    "seed {seed}: session still live after {op:?}"
                );
            }
        }
    }

    fn check_invariants(&self, step: usize) {
        let seed = self.seed;
        let layer = &self.h.layer;

        assert_eq!(
            layer.listeners().len(),
            self.model.listeners.len(),
            "seed {seed} step {step}: listener count"
        );
        let keys: BTreeSet<_> = layer.listeners().iter().map(|listener| listener.key.clone()).collect();
        assert_eq!(keys.len(), layer.listeners().len(), "seed {seed} step {step}: duplicate key");

        for (&slot, expected) in &self.model.listeners {
            let al_index = ListenerIndex::from_handle(expected.handle);
            assert_eq!(
                layer.lookup().lookup_global_exact(0, &endpoint(slot)),
                Some(al_index),
                "seed {seed} step {step}: global table for slot {slot}"
            );
            let listener = layer
                .listeners()
                .get(al_index)
                .unwrap_or_else(|| panic!("seed {seed} step {step}: listener for slot {slot} missing"));
            assert_eq!(listener.app_index, self.apps[expected.owner]);
            let workers: BTreeSet<_> = expected
                .workers
                .iter()
                .filter_map(|&map_index| layer.apps().app_worker(self.apps[expected.owner], map_index))
                .map(|worker| worker.wrk_index)
                .collect();
            assert_eq!(
                listener.workers().collect::<BTreeSet<_>>(),
                workers,
                "seed {seed} step {step}: workers of slot {slot}"
            );
        }

        let co_located = self
            .model
            .sessions
            .iter()
            .filter(|session| session.scope != ConnectScope::Transport)
            .count();
        let remote = self.model.sessions.len() - co_located;
        // Every listener here is global, so each one holds a listener session.
        assert_eq!(
            layer.session_pools().session_count(OWNER_THREAD_INDEX),
            self.model.listeners.len() + co_located,
            "seed {seed} step {step}: owner pool"
        );
        assert_eq!(
            layer.session_pools().session_count(TRANSPORT_THREAD),
            remote,
            "seed {seed} step {step}: transport pool"
        );
        for session in &self.model.sessions {
            assert!(
                layer.session_pools().is_live(session.handle),
                "seed {seed} step {step}: {session:?} not live"
            );
        }
    }

    fn detach_all(&mut self) {
        for &app in &self.apps {
            self.h.layer.detach(DetachArgs::all(app)).expect("detach");
        }
        let layer = &self.h.layer;
        assert!(layer.listeners().is_empty(), "seed {}: listeners leaked", self.seed);
        assert_eq!(layer.apps().worker_count(), 0);
        assert_eq!(layer.session_pools().session_count(OWNER_THREAD_INDEX), 0);
        assert_eq!(layer.session_pools().session_count(TRANSPORT_THREAD), 0);
    }
}

fn run_workload(seed: u64, steps: usize, weights: &OpWeights) -> ControlPlaneModel {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut workload = Workload::new(seed);
    for step in 0..steps {
        let op = pick_op(&mut rng, weights, &workload.model);
        workload.apply(op);
        workload.check_invariants(step);
    }
    workload.detach_all();
    workload.model
}

#[test]
fn test_random_workload_matches_model() {
    for seed in 0..16 {
        let model = run_workload(seed, 250, &OpWeights::default());
        assert!(model.total_ops > 0);
    }
}

#[test]
fn test_listener_churn_matches_model() {
    let mut rejected = 0;
    for seed in 100..108 {
        let model = run_workload(seed, 400, &OpWeights::listener_churn());
        rejected += model.rejections.values().sum::<u64>();
    }
    // Three apps fighting over six endpoints always collide somewhere.
    assert!(rejected > 0);
}

#[test]
fn test_same_seed_same_outcome() {
    let first = run_workload(7, 200, &OpWeights::default());
    let second = run_workload(7, 200, &OpWeights::default());
    assert_eq!(first.total_ops, second.total_ops);
    assert_eq!(first.rejections, second.rejections);
    assert_eq!(first.listeners.len(), second.listeners.len());
}
