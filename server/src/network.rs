//! Server network layer handling UDP communications and game loop coordination
//!
//! The receive task writes decompressed inputs straight into the shared
//! [`ClientManager`] and answers clock probes itself, so neither waits on the
//! game loop. Connection changes are forwarded to the game loop, which owns
//! the simulation and is the only place bodies are created or removed.

use crate::client_manager::ClientManager;
use crate::game::ServerGame;
use log::{debug, error, info, warn};
use shared::clock::{MonotonicClock, TimeReply, TimeSource};
use shared::config::SimulationConfig;
use shared::input::decompress_inputs;
use shared::protocol::{Packet, MAX_PACKET_SIZE, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    ClientTimeout { client_id: u32, object_id: u32 },
    Shutdown,
}

/// Messages sent from game loop to network tasks
#[derive(Debug)]
pub enum GameMessage {
    SendPacket {
        packet: Packet,
        addr: SocketAddr,
    },
    BroadcastPacket {
        packet: Packet,
        exclude: Option<u32>,
    },
}

/// Main server coordinating networking and game simulation
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    game: ServerGame,
    clock: MonotonicClock,
    tick_duration: Duration,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: mpsc::UnboundedReceiver<GameMessage>,
}

impl Server {
    pub async fn new(
        addr: &str,
        config: SimulationConfig,
        max_clients: usize,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();
        let tick_duration = Duration::from_secs_f32(config.fixed_dt);
        let clients = ClientManager::new(max_clients, config.input_capacity);

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(clients)),
            game: ServerGame::new(config),
            clock: MonotonicClock::new(),
            tick_duration,
            server_tx,
            server_rx,
            game_tx,
            game_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sender that stops the main loop when given [`ServerMessage::Shutdown`]
    pub fn control(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task that continuously listens for incoming packets
    async fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();
        let clock = self.clock;

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_PACKET_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let packet = match Packet::decode(&buffer[..len]) {
                            Ok(packet) => packet,
                            Err(e) => {
                                warn!("Failed to deserialize packet from {}: {}", addr, e);
                                continue;
                            }
                        };

                        match packet {
                            Packet::Inputs { inputs } => {
                                let mut clients_guard = clients.write().await;
                                match clients_guard.find_client_by_addr(addr) {
                                    Some(client_id) => {
                                        clients_guard
                                            .add_inputs(client_id, decompress_inputs(&inputs));
                                    }
                                    None => debug!("Inputs from unknown address {}", addr),
                                }
                            }
                            Packet::TimeProbe(probe) => {
                                let client_id = clients.read().await.find_client_by_addr(addr);
                                let Some(client_id) = client_id else {
                                    debug!("Time probe from unknown address {}", addr);
                                    continue;
                                };

                                let reply = Packet::TimeReply(TimeReply::answer(&probe, clock.now()));
                                if let Err(e) = Self::send_packet_impl(&socket, &reply, addr).await {
                                    error!("Failed to answer time probe from {}: {}", addr, e);
                                }
                                clients.write().await.touch(client_id);
                            }
                            packet => {
                                if let Err(e) =
                                    server_tx.send(ServerMessage::PacketReceived { packet, addr })
                                {
                                    error!("Failed to send packet to main loop: {}", e);
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes outgoing packet queue
    async fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);
        let mut game_rx = std::mem::replace(&mut self.game_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = game_rx.recv().await {
                match message {
                    GameMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    GameMessage::BroadcastPacket { packet, exclude } => {
                        let client_addrs = {
                            let clients_guard = clients.read().await;
                            clients_guard.get_client_addrs()
                        };

                        let data = match packet.encode() {
                            Ok(data) => data,
                            Err(e) => {
                                error!("Failed to encode broadcast: {}", e);
                                continue;
                            }
                        };

                        for (client_id, addr) in client_addrs {
                            if Some(client_id) == exclude {
                                continue;
                            }

                            if let Err(e) = socket.send_to(&data, addr).await {
                                error!("Failed to send to client {}: {}", client_id, e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that monitors client timeouts
    async fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts()
                };

                for (client_id, object_id) in timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::ClientTimeout {
                        client_id,
                        object_id,
                    }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = packet.encode()?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.game_tx.send(GameMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn broadcast_packet(&self, packet: Packet, exclude: Option<u32>) {
        if let Err(e) = self
            .game_tx
            .send(GameMessage::BroadcastPacket { packet, exclude })
        {
            error!("Failed to queue broadcast packet: {}", e);
        }
    }

    /// Handles connection changes forwarded by the receive task
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect { client_version } => {
                info!(
                    "Client connecting from {} (version: {})",
                    addr, client_version
                );

                if client_version != PROTOCOL_VERSION {
                    self.send_packet(
                        Packet::Disconnected {
                            reason: "Protocol version mismatch".to_string(),
                        },
                        addr,
                    );
                    return;
                }

                // Remove existing connection if present
                let previous_object = {
                    let mut clients = self.clients.write().await;
                    clients
                        .find_client_by_addr(addr)
                        .and_then(|existing| clients.remove_client(&existing))
                };
                if let Some(object_id) = previous_object {
                    self.game.despawn_actor(object_id);
                }

                let assigned = {
                    let mut clients = self.clients.write().await;
                    clients.add_client(addr)
                };

                let Some((client_id, object_id)) = assigned else {
                    self.send_packet(
                        Packet::Disconnected {
                            reason: "Server full".to_string(),
                        },
                        addr,
                    );
                    return;
                };

                if let Err(e) = self.game.spawn_actor(object_id) {
                    error!("Failed to spawn object for client {}: {}", client_id, e);
                    self.clients.write().await.remove_client(&client_id);
                    return;
                }

                self.send_packet(
                    Packet::Connected {
                        client_id,
                        object_id,
                        server_frame: self.game.frame(),
                    },
                    addr,
                );
            }

            Packet::Disconnect => {
                let removed = {
                    let mut clients = self.clients.write().await;
                    clients
                        .find_client_by_addr(addr)
                        .and_then(|client_id| clients.remove_client(&client_id))
                };
                if let Some(object_id) = removed {
                    self.game.despawn_actor(object_id);
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    /// Runs the fixed steps due and broadcasts on the configured cadence
    ///
    /// The client lock is held only while this tick's inputs are drained;
    /// the receive task can buffer new inputs while physics runs.
    async fn tick(&mut self, dt: f64) {
        let frames = self.game.frames_due(dt);
        let queued = if frames.is_empty() {
            Default::default()
        } else {
            self.clients.write().await.drain_frames(frames)
        };

        match self.game.advance_queued(dt, queued) {
            Ok(Some(snapshot)) => {
                let packet = Packet::Snapshot {
                    server_time: self.clock.now(),
                    snapshot,
                    live_objects: self.game.live_objects(),
                };
                self.broadcast_packet(packet, None);
            }
            Ok(None) => {}
            Err(e) => error!("Simulation error at frame {}: {}", self.game.frame(), e),
        }
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        // Initialize concurrent tasks
        self.spawn_network_receiver().await;
        self.spawn_network_sender().await;
        self.spawn_timeout_checker().await;

        let mut tick_interval = interval(self.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_tick = Instant::now();
        let mut last_report = 0;

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::ClientTimeout { client_id, object_id }) => {
                            info!("Client {} timed out", client_id);
                            self.game.despawn_actor(object_id);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_tick).as_secs_f64();
                    last_tick = now;

                    self.tick(dt).await;

                    let frame = self.game.frame();
                    if frame / 300 != last_report {
                        last_report = frame / 300;
                        let client_count = self.clients.read().await.len();
                        debug!(
                            "Frame {}: {} clients, {} objects",
                            frame, client_count, self.game.object_count()
                        );
                    }
                },
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_server_message_creation() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8080);
        let msg = ServerMessage::PacketReceived {
            packet: Packet::Connect { client_version: 1 },
            addr,
        };

        match msg {
            ServerMessage::PacketReceived {
                packet: Packet::Connect { client_version },
                addr: a,
            } => {
                assert_eq!(a, addr);
                assert_eq!(client_version, 1);
            }
            _ => panic!("Unexpected message type"),
        }
    }

    #[test]
    fn test_channel_communication() {
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

        tx.send(ServerMessage::ClientTimeout {
            client_id: 4,
            object_id: 9,
        })
        .unwrap();

        match rx.try_recv().unwrap() {
            ServerMessage::ClientTimeout {
                client_id,
                object_id,
            } => {
                assert_eq!(client_id, 4);
                assert_eq!(object_id, 9);
            }
            _ => panic!("Unexpected message type"),
        }
    }

    #[tokio::test]
    async fn test_connect_handshake() {
        let mut server = Server::new("127.0.0.1:0", SimulationConfig::default(), 4)
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();
        let control = server.control();
        let handle = tokio::spawn(async move { server.run().await.map_err(|e| e.to_string()) });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let connect = Packet::Connect {
            client_version: PROTOCOL_VERSION,
        };
        socket
            .send_to(&connect.encode().unwrap(), server_addr)
            .await
            .unwrap();

        let mut buffer = vec![0u8; MAX_PACKET_SIZE];
        let connected = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let (len, _) = socket.recv_from(&mut buffer).await.unwrap();
                if let Ok(Packet::Connected { object_id, .. }) = Packet::decode(&buffer[..len]) {
                    return object_id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(connected, 1);

        control.send(ServerMessage::Shutdown).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let mut server = Server::new("127.0.0.1:0", SimulationConfig::default(), 4)
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();
        let control = server.control();
        let handle = tokio::spawn(async move { server.run().await.map_err(|e| e.to_string()) });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let connect = Packet::Connect { client_version: 999 };
        socket
            .send_to(&connect.encode().unwrap(), server_addr)
            .await
            .unwrap();

        let mut buffer = vec![0u8; MAX_PACKET_SIZE];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            Packet::decode(&buffer[..len]).unwrap(),
            Packet::Disconnected { .. }
        ));

        control.send(ServerMessage::Shutdown).unwrap();
        handle.await.unwrap().unwrap();
    }
}
