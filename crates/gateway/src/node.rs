// Gateway node
//
// Wires one gateway instance together: bus subscription and dispatcher,
// broker listener and event router, presence coordinator, client handlers
// and the socket server.

use crate::auth::IdentityVerifier;
use crate::dispatcher::Dispatcher;
use crate::handlers::{BrokerEventRouter, ClientHandlers};
use crate::presence::PresenceCoordinator;
use crate::registry::ConnectionRegistry;
use crate::server::GatewayServer;
use anyhow::{Context, Result};
use beacon_broker::{CorrelationClient, Directory, EventBus, FriendDirectoryClient, FriendLookup, Transport};
use beacon_core::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A running gateway instance
pub struct GatewayNode {
    local_addr: SocketAddr,
    coordinator: Arc<PresenceCoordinator>,
    bus: EventBus,
    tasks: Vec<JoinHandle<()>>,
}

impl GatewayNode {
    /// Bind the configured address and start serving
    pub async fn start(
        config: Config,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn Directory>,
        verifier: Arc<dyn IdentityVerifier>,
        friends: Option<Arc<dyn FriendLookup>>,
    ) -> Result<Self> {
        let addr = config.gateway.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        Self::start_on(listener, config, transport, directory, verifier, friends).await
    }

    /// Start serving on an already bound listener
    pub async fn start_on(
        listener: TcpListener,
        config: Config,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn Directory>,
        verifier: Arc<dyn IdentityVerifier>,
        friends: Option<Arc<dyn FriendLookup>>,
    ) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let mut tasks = Vec::new();

        let bus = EventBus::new(transport.clone(), config.bus.clone());
        let registry = Arc::new(ConnectionRegistry::new());

        // Every instance hears every bus event and delivers to its own sockets
        let events = bus.subscribe().await.context("Failed to subscribe to the event bus")?;
        tasks.push(tokio::spawn(Dispatcher::new(registry.clone()).run(events)));

        let rpc = Arc::new(CorrelationClient::from_config(transport, &config.broker));
        let (unsolicited_tx, unsolicited_rx) = mpsc::unbounded_channel();
        let listener_task = rpc
            .clone()
            .run_listener(config.broker.inbound_topics(), unsolicited_tx)
            .await
            .context("Failed to subscribe to broker topics")?;
        tasks.push(listener_task);
        tasks.push(tokio::spawn(BrokerEventRouter::new(bus.clone()).run(unsolicited_rx)));

        let friends: Arc<dyn FriendLookup> = match friends {
            Some(friends) => friends,
            None => Arc::new(FriendDirectoryClient::new(
                rpc.clone(),
                config.broker.friend_topic.clone(),
            )),
        };

        let coordinator = Arc::new(PresenceCoordinator::new(
            registry,
            directory,
            friends,
            bus.clone(),
            &config.presence,
        ));
        let handlers = Arc::new(ClientHandlers::new(
            coordinator.clone(),
            rpc,
            bus.clone(),
            config.broker.message_topic.clone(),
        ));

        let server = GatewayServer::new(config.gateway.clone(), verifier, coordinator.clone(), handlers);
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                tracing::error!("Gateway server stopped: {:#}", e);
            }
        }));

        tracing::info!(
            addr = %local_addr,
            instance_id = %config.gateway.instance_id,
            transport = bus.transport_name(),
            "Gateway node started"
        );

        Ok(Self {
            local_addr,
            coordinator,
            bus,
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn coordinator(&self) -> &Arc<PresenceCoordinator> {
        &self.coordinator
    }

    /// True while the broker connection is being re-established
    pub fn is_degraded(&self) -> bool {
        self.bus.is_degraded()
    }

    /// Stop background tasks and drop pending presence timers
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.coordinator.cancel_all();
        tracing::info!(addr = %self.local_addr, "Gateway node stopped");
    }
}
