//! Application state shared across request handlers and background tasks.

use std::sync::Arc;

use fleet_link::{CommandDispatcher, ConnectionSupervisor, DispatcherConfig, MonotonicClock};
use fleet_sync::{EngineConfig, OrderingEngine, SyncMessageType};

use crate::broadcaster::FleetBroadcaster;
use crate::config::Config;
use crate::link::PollSessions;
use crate::nodes::NodeStore;
use crate::pending::PendingSyncStore;
use crate::protocol::HostStateRecorder;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    supervisor: ConnectionSupervisor,
    dispatcher: Arc<CommandDispatcher>,
    engine: Arc<OrderingEngine>,
    nodes: NodeStore,
    broadcaster: FleetBroadcaster,
    polls: PollSessions,
    clock: Arc<MonotonicClock>,
}

impl AppState {
    /// Build the admin's link machinery. Must be called within a Tokio
    /// runtime.
    pub fn new(config: Config, store: Arc<dyn PendingSyncStore>) -> Self {
        let clock = Arc::new(MonotonicClock::new());
        let supervisor = ConnectionSupervisor::accepting(config.supervisor());
        let dispatcher = Arc::new(
            CommandDispatcher::new(
                supervisor.clone(),
                DispatcherConfig {
                    default_timeout: config.command_timeout,
                    ..DispatcherConfig::default()
                },
            )
            .with_clock(Arc::clone(&clock)),
        );

        let nodes = NodeStore::new();
        let recorder = Arc::new(HostStateRecorder::new(nodes.clone()));
        let engine = [
            SyncMessageType::Heartbeat,
            SyncMessageType::Status,
            SyncMessageType::Metrics,
            SyncMessageType::Event,
        ]
        .into_iter()
        .fold(OrderingEngine::new(EngineConfig::default()), |engine, kind| {
            engine.with_handler(kind, recorder.clone())
        });

        let broadcaster = FleetBroadcaster::new(
            Arc::clone(&dispatcher),
            nodes.clone(),
            store,
            Arc::clone(&clock),
            config.command_timeout,
        );

        Self {
            inner: Arc::new(AppStateInner {
                config,
                supervisor,
                dispatcher,
                engine: Arc::new(engine),
                nodes,
                broadcaster,
                polls: PollSessions::new(),
                clock,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.inner.supervisor
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.inner.dispatcher
    }

    pub fn engine(&self) -> &OrderingEngine {
        &self.inner.engine
    }

    pub fn nodes(&self) -> &NodeStore {
        &self.inner.nodes
    }

    pub fn broadcaster(&self) -> &FleetBroadcaster {
        &self.inner.broadcaster
    }

    pub fn polls(&self) -> &PollSessions {
        &self.inner.polls
    }

    pub fn clock(&self) -> &MonotonicClock {
        &self.inner.clock
    }
}
