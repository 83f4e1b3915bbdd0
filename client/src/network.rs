use crate::game::{ClientEvent, ClientGame, ClientStats};
use crate::input::InputSource;
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::clock::MonotonicClock;
use shared::config::{ClockSyncConfig, SimulationConfig};
use shared::protocol::{Packet, MAX_PACKET_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};

const CONNECT_RETRY: Duration = Duration::from_secs(1);
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Artificial latency and loss applied to both directions of the link
pub struct LinkConditioner {
    one_way: Duration,
    packet_loss: f64,
    rng: StdRng,
}

impl LinkConditioner {
    /// `fake_ping_ms` is a round trip; half of it delays each direction.
    pub fn new(fake_ping_ms: u64, packet_loss: f64, seed: u64) -> Self {
        Self {
            one_way: Duration::from_millis(fake_ping_ms / 2),
            packet_loss: packet_loss.clamp(0.0, 1.0),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn perfect() -> Self {
        Self::new(0, 0.0, 0)
    }

    pub fn one_way(&self) -> Duration {
        self.one_way
    }

    pub fn should_drop(&mut self) -> bool {
        self.packet_loss > 0.0 && self.rng.gen_bool(self.packet_loss)
    }
}

pub struct Client {
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    game: ClientGame<MonotonicClock>,
    source: Box<dyn InputSource + Send>,
    link: LinkConditioner,
    tick_duration: Duration,
    run_for: Option<Duration>,
}

impl Client {
    pub async fn new(
        server_addr: &str,
        config: SimulationConfig,
        source: Box<dyn InputSource + Send>,
        link: LinkConditioner,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;
        let tick_duration = Duration::from_secs_f32(config.fixed_dt);

        Ok(Client {
            socket: Arc::new(socket),
            server_addr,
            game: ClientGame::new(config, MonotonicClock::new(), ClockSyncConfig::default()),
            source,
            link,
            tick_duration,
            run_for: None,
        })
    }

    /// Stops [`Client::run`] after `duration` instead of running until the
    /// server disconnects us.
    pub fn with_run_duration(mut self, duration: Duration) -> Self {
        self.run_for = Some(duration);
        self
    }

    pub fn game(&self) -> &ClientGame<MonotonicClock> {
        &self.game
    }

    async fn send_packet(&mut self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        if self.link.should_drop() {
            debug!("Dropped outgoing {:?}", packet);
            return Ok(());
        }

        let data = packet.encode()?;
        let delay = self.link.one_way();
        if delay.is_zero() {
            self.socket.send_to(&data, self.server_addr).await?;
            return Ok(());
        }

        let socket = Arc::clone(&self.socket);
        let addr = self.server_addr;
        tokio::spawn(async move {
            sleep(delay).await;
            if let Err(e) = socket.send_to(&data, addr).await {
                error!("Error sending delayed packet: {}", e);
            }
        });
        Ok(())
    }

    /// Reads datagrams from the server and hands them over after the
    /// configured one-way delay.
    fn spawn_receiver(&self) -> (mpsc::UnboundedReceiver<Packet>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = Arc::clone(&self.socket);
        let server_addr = self.server_addr;
        let delay = self.link.one_way();

        let handle = tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_PACKET_SIZE];
            loop {
                let (len, addr) = match socket.recv_from(&mut buffer).await {
                    Ok(received) => received,
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        continue;
                    }
                };

                if addr != server_addr {
                    warn!("Ignoring packet from unexpected address {}", addr);
                    continue;
                }

                let packet = match Packet::decode(&buffer[..len]) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!("Failed to decode packet from server: {}", e);
                        continue;
                    }
                };

                if delay.is_zero() {
                    if tx.send(packet).is_err() {
                        break;
                    }
                } else {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        sleep(delay).await;
                        let _ = tx.send(packet);
                    });
                }
            }
        });

        (rx, handle)
    }

    fn handle_packet(&mut self, packet: Packet) -> bool {
        if self.link.should_drop() {
            debug!("Dropped incoming packet");
            return true;
        }

        match self.game.handle_packet(packet) {
            Ok(ClientEvent::Disconnected(_)) => false,
            Ok(_) => true,
            Err(e) => {
                error!("Error handling packet: {}", e);
                true
            }
        }
    }

    async fn tick(&mut self, dt: f64) {
        if let Err(e) = self.game.step(dt, self.source.as_mut()) {
            error!("Prediction step failed: {}", e);
        }

        if let Some(packet) = self.game.outgoing_inputs() {
            if let Err(e) = self.send_packet(&packet).await {
                error!("Error sending inputs: {}", e);
            }
        }

        if let Some(probe) = self.game.poll_probe() {
            if let Err(e) = self.send_packet(&probe).await {
                error!("Error sending time probe: {}", e);
            }
        }
    }

    fn log_stats(&self) {
        let stats = self.game.stats();
        info!(
            "Frame {} | snapshots {} | corrections {} ({} frames replayed) | realigned {} | rtt {:.1}ms | offset {:.4}s",
            stats.frame,
            stats.snapshots,
            stats.corrections,
            stats.replayed_frames,
            stats.realignments,
            stats.rtt.unwrap_or(0.0) * 1000.0,
            stats.clock_offset
        );
    }

    /// Connects, predicts and reconciles until the run duration elapses or
    /// the server disconnects us. Returns the final statistics.
    pub async fn run(&mut self) -> Result<ClientStats, Box<dyn std::error::Error>> {
        info!("Connecting to server at {}", self.server_addr);
        let (mut packets, receiver) = self.spawn_receiver();

        let mut tick_interval = interval(self.tick_duration);
        let mut connect_interval = interval(CONNECT_RETRY);
        let mut stats_interval = interval(STATS_INTERVAL);
        let deadline = sleep(self.run_for.unwrap_or_default());
        tokio::pin!(deadline);
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                packet = packets.recv() => {
                    let Some(packet) = packet else { break };
                    if !self.handle_packet(packet) {
                        break;
                    }
                }

                _ = connect_interval.tick(), if !self.game.is_connected() => {
                    let connect = self.game.connect_packet();
                    if let Err(e) = self.send_packet(&connect).await {
                        error!("Error sending connect: {}", e);
                    }
                }

                _ = tick_interval.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_tick).as_secs_f64();
                    last_tick = now;
                    self.tick(dt).await;
                }

                _ = stats_interval.tick() => self.log_stats(),

                _ = &mut deadline, if self.run_for.is_some() => {
                    info!("Run duration elapsed");
                    break;
                }
            }
        }

        if self.game.is_connected() {
            let data = Packet::Disconnect.encode()?;
            let _ = self.socket.send_to(&data, self.server_addr).await;
        }
        receiver.abort();

        self.log_stats();
        Ok(self.game.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_link_never_drops() {
        let mut link = LinkConditioner::perfect();
        assert!((0..1000).all(|_| !link.should_drop()));
        assert!(link.one_way().is_zero());
    }

    #[test]
    fn test_lossy_link_drops_roughly_the_configured_share() {
        let mut link = LinkConditioner::new(100, 0.25, 7);
        let dropped = (0..10_000).filter(|_| link.should_drop()).count();

        assert_eq!(link.one_way(), Duration::from_millis(50));
        assert!(dropped > 2000 && dropped < 3000, "dropped {}", dropped);
    }

    #[tokio::test]
    async fn test_client_stops_after_run_duration_without_server() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap().to_string();

        let source = Box::new(crate::input::BotInput::new(1));
        let mut client = Client::new(&addr, SimulationConfig::default(), source, LinkConditioner::perfect())
            .await
            .unwrap()
            .with_run_duration(Duration::from_millis(200));

        let stats = client.run().await.unwrap();
        assert!(!client.game().is_connected());
        assert_eq!(stats.frame, 0);

        let mut buffer = [0u8; 256];
        let (len, _) = silent.recv_from(&mut buffer).await.unwrap();
        assert!(matches!(
            Packet::decode(&buffer[..len]).unwrap(),
            Packet::Connect { .. }
        ));
    }
}
