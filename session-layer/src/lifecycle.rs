//! Attach, worker management and detach.

use tokio::sync::mpsc;

use crate::application::{AppEvent, AppEventReceiver, AppIndex, AppOptions, NewApplication, WorkerIndex};
use crate::dispatch::{ControlOp, Dispatched};
use crate::error::{SessionError, SessionResult};
use crate::layer::SessionLayer;
use crate::providers::{ProxySetup, Providers, Segment, SegmentManagerId, SegmentProvider, TransportProvider};

/// Arguments of an attach request.
///
/// An application is identified by its API client, by its name, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachArgs {
    /// API client attaching the application.
    pub api_client_index: Option<u32>,
    /// Application name.
    pub name: Option<String>,
    /// Attach options.
    pub options: AppOptions,
}

impl AttachArgs {
    /// Attach identified by an API client.
    pub fn for_client(api_client_index: u32) -> Self {
        Self {
            api_client_index: Some(api_client_index),
            ..Self::default()
        }
    }

    /// Attach identified by a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Set the options.
    pub fn with_options(mut self, options: AppOptions) -> Self {
        self.options = options;
        self
    }
}

/// A freshly created worker.
#[derive(Debug)]
pub struct WorkerAttachment {
    /// Worker index.
    pub wrk_index: WorkerIndex,
    /// Position in the application's worker map.
    pub wrk_map_index: u32,
    /// The worker's event queue.
    pub events: AppEventReceiver,
    /// First segment manager of the worker.
    pub segment_manager: SegmentManagerId,
    /// Descriptor of the worker's first segment.
    pub segment: Segment,
}

/// Result of a successful attach.
#[derive(Debug)]
pub struct Attached {
    /// The application.
    pub app: AppIndex,
    /// Its default worker.
    pub worker: WorkerAttachment,
}

/// Arguments of a detach request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetachArgs {
    /// Application to detach.
    pub app: AppIndex,
    /// Only detach the workers of this API client.
    pub api_client_index: Option<u32>,
}

impl DetachArgs {
    /// Detach the whole application.
    pub fn all(app: AppIndex) -> Self {
        Self {
            app,
            api_client_index: None,
        }
    }

    /// Detach the workers of one API client.
    pub fn client(app: AppIndex, api_client_index: u32) -> Self {
        Self {
            app,
            api_client_index: Some(api_client_index),
        }
    }
}

impl<P: Providers> SessionLayer<P> {
    /// Attach an application with one default worker. Owner thread only.
    ///
    /// Nothing is left behind when attach fails.
    pub fn attach(&mut self, args: AttachArgs) -> SessionResult<Attached> {
        self.ensure_owner_thread()?;

        let name = match (args.name, args.api_client_index) {
            (Some(name), _) => name,
            (None, Some(client)) => format!("client-{client}"),
            (None, None) => return Err(SessionError::invalid("attach needs an api client or a name")),
        };
        let existing = args
            .api_client_index
            .and_then(|client| self.apps.lookup_api_client(client))
            .or_else(|| self.apps.lookup_name(&name));
        if existing.is_some() {
            return Err(SessionError::AlreadyAttached);
        }

        let options = args.options;
        let ns_index = self
            .namespaces
            .resolve_namespace(&options.namespace_id, options.namespace_secret)?;

        let app_index = self.apps.alloc_app(NewApplication {
            name,
            api_client_index: args.api_client_index,
            ns_index,
            flags: options.flags,
            proxied_transports: options.proxied_transports,
            segment_size: options.segment_size.unwrap_or(self.config.segment_size),
        });
        let worker = match self.alloc_worker(app_index, args.api_client_index) {
            Ok(worker) => worker,
            Err(err) => {
                self.apps.free_app(app_index);
                return Err(err);
            }
        };

        if let Some(app) = self.apps.app(app_index) {
            if app.is_proxy() {
                self.providers.proxy().setup_proxy(app);
            }
            tracing::info!(
                app = %app_index,
                name = %app.name,
                ns = %ns_index,
                flags = ?app.flags,
                "application attached"
            );
        }
        Ok(Attached {
            app: app_index,
            worker,
        })
    }

    /// Add a worker to an attached application. Owner thread only.
    pub fn add_worker(
        &mut self,
        app: AppIndex,
        api_client_index: Option<u32>,
    ) -> SessionResult<WorkerAttachment> {
        self.ensure_owner_thread()?;
        let worker = self.alloc_worker(app, api_client_index)?;
        tracing::info!(app = %app, wrk = %worker.wrk_index, map_index = worker.wrk_map_index, "worker added");
        Ok(worker)
    }

    /// Detach an application, or only the workers of one API client.
    ///
    /// Off the owner thread the detach is queued and nothing is touched
    /// until the owner thread runs it.
    pub fn detach(&mut self, args: DetachArgs) -> SessionResult<Dispatched<()>> {
        if self.apps.app(args.app).is_none() {
            return Err(SessionError::ApplicationNotAttached);
        }
        if !self.dispatcher.is_owner_thread() {
            self.dispatcher.enqueue(ControlOp::Detach(args));
            return Ok(Dispatched::Deferred);
        }
        self.detach_inline(args).map(Dispatched::Completed)
    }

    /// Create a worker with its own segment manager and event queue.
    fn alloc_worker(&mut self, app_index: AppIndex, api_client_index: Option<u32>) -> SessionResult<WorkerAttachment> {
        let app = self
            .apps
            .app(app_index)
            .ok_or(SessionError::ApplicationNotAttached)?;
        let manager_name = format!("{}-{}", app.name, app.workers.len());
        let segments = self.providers.segments();
        let segment_manager = segments.create_manager(&manager_name, app.segment_size)?;

        // The guard keeps the manager table read-locked; copy the descriptor
        // out and let it go before anything else happens.
        let segment = match segments.acquire_segment(segment_manager, 0) {
            Ok(guard) => Segment::clone(&guard),
            Err(err) => {
                segments.delete_manager(segment_manager);
                return Err(err.into());
            }
        };

        let (tx, events) = mpsc::unbounded_channel();
        let Some(wrk_index) = self
            .apps
            .alloc_worker(app_index, api_client_index, segment_manager, tx)
        else {
            self.providers.segments().delete_manager(segment_manager);
            return Err(SessionError::ApplicationNotAttached);
        };
        let wrk_map_index = self
            .apps
            .worker(wrk_index)
            .map_or(0, |worker| worker.wrk_map_index);
        Ok(WorkerAttachment {
            wrk_index,
            wrk_map_index,
            events,
            segment_manager,
            segment,
        })
    }

    pub(crate) fn detach_inline(&mut self, args: DetachArgs) -> SessionResult<()> {
        let app = self
            .apps
            .app(args.app)
            .ok_or(SessionError::ApplicationNotAttached)?;
        let workers: Vec<WorkerIndex> = app
            .workers()
            .filter(|&wrk| match args.api_client_index {
                Some(client) => self
                    .apps
                    .worker(wrk)
                    .is_some_and(|worker| worker.api_client_index == Some(client)),
                None => true,
            })
            .collect();
        if workers.is_empty() && args.api_client_index.is_some() {
            return Err(SessionError::WorkerNotFound);
        }

        for wrk_index in workers {
            self.free_worker(wrk_index);
        }

        let remaining = self.apps.app(args.app).map_or(0, |app| app.worker_count());
        if remaining == 0 {
            self.free_app(args.app);
        }
        Ok(())
    }

    /// Tear down a worker: its listener memberships, local sessions,
    /// transport connects and segment manager.
    fn free_worker(&mut self, wrk_index: WorkerIndex) {
        let Some(worker) = self.apps.worker(wrk_index) else {
            return;
        };
        let app_index = worker.app_index;
        let listeners: Vec<_> = worker.listeners().collect();
        let local_sessions: Vec<_> = worker.local_sessions().collect();
        let connects: Vec<_> = worker.connects().collect();
        let segment_manager = worker.first_segment_manager;

        for al_index in listeners {
            self.stop_listen(wrk_index, al_index);
        }
        for handle in local_sessions {
            self.teardown_local_session(handle);
        }
        for handle in connects {
            // Slots may have been reused since, even by a sibling worker.
            let owned = self
                .sessions
                .resolve(handle)
                .is_ok_and(|session| session.app_wrk_index == wrk_index);
            if owned {
                self.providers.transport().close(handle);
            }
        }
        self.providers.segments().delete_manager(segment_manager);

        if let Some(worker) = self.apps.free_worker(wrk_index) {
            worker.notify(AppEvent::Detached);
        }
        tracing::debug!(app = %app_index, wrk = %wrk_index, "worker freed");
    }

    fn free_app(&mut self, app_index: AppIndex) {
        let listeners: Vec<_> = self
            .apps
            .app(app_index)
            .map(|app| app.listeners().collect())
            .unwrap_or_default();
        for al_index in listeners {
            self.destroy_listener(al_index);
        }
        if let Some(app) = self.apps.free_app(app_index) {
            tracing::info!(app = %app_index, name = %app.name, "application detached");
        }
    }
}
