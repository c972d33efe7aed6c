use std::{
    net::{IpAddr, SocketAddr, TcpListener},
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;

use crate::{
    SerialTransport, TxEnable,
    bridge::{Bridge, BridgeStats},
    config::BridgeConfig,
    error::BridgeError,
    manager::Acceptor,
};

/// How long a turn in progress at shutdown may take to put its bytes on the wire.
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(100);

/// Runs a [`Bridge`] on a timer until cancelled.
///
/// The bridge itself is synchronous; the server only decides when the next pass runs.
/// It must be driven on a current-thread runtime or a `LocalSet`, since backends are
/// not required to be `Send`.
#[derive(Debug)]
pub struct Server<U, P> {
    config: BridgeConfig,
    uart: U,
    tx_enable: P,
}

impl<U: SerialTransport, P: TxEnable> Server<U, P> {
    pub fn new(config: BridgeConfig, uart: U, tx_enable: P) -> Server<U, P> {
        Server {
            config,
            uart,
            tx_enable,
        }
    }

    /// Binds a TCP listener on `ip` and the configured port, and serves clients until
    /// `shutdown` is cancelled.
    pub async fn listen(
        self,
        ip: IpAddr,
        shutdown: CancellationToken,
    ) -> Result<BridgeStats, BridgeError> {
        let listener = TcpListener::bind(SocketAddr::new(ip, self.config.port))?;
        listener.set_nonblocking(true)?;
        log::info!(
            "Server listening for connections on {}",
            listener.local_addr()?
        );
        self.run(listener, shutdown).await
    }

    /// Serves clients from `acceptor` until `shutdown` is cancelled or the bridge fails.
    pub async fn run<A: Acceptor>(
        self,
        acceptor: A,
        shutdown: CancellationToken,
    ) -> Result<BridgeStats, BridgeError> {
        let mut bridge = Bridge::new(self.config, self.uart, self.tx_enable, acceptor)?;
        log::info!("{}", bridge.config());

        let mut result = loop {
            let now = Instant::now();
            if let Err(e) = bridge.poll(now) {
                log::error!("Bridge failed: {}", e);
                break Err(e);
            }
            let wake = tokio::time::Instant::from_std(bridge.next_wake(now));
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = tokio::time::sleep_until(wake) => {}
            }
        };

        log::info!("Shutting down RS485 stream bridge");
        bridge.begin_shutdown();
        if result.is_ok() {
            let deadline = Instant::now() + SHUTDOWN_DRAIN;
            while !bridge.is_quiescent() && Instant::now() < deadline {
                let now = Instant::now();
                if let Err(e) = bridge.poll(now) {
                    log::error!("Bridge failed while draining: {}", e);
                    result = Err(e);
                    break;
                }
                tokio::time::sleep_until(tokio::time::Instant::from_std(bridge.next_wake(now)))
                    .await;
            }
            if result.is_ok() && !bridge.is_quiescent() {
                log::warn!(
                    "Transmission did not finish within {}ms, forcing receive mode",
                    SHUTDOWN_DRAIN.as_millis()
                );
            }
        }
        match bridge.release() {
            Ok(()) => log::debug!("TX enable set LOW on shutdown"),
            Err(e) => log::error!("Could not release TX enable on shutdown: {}", e),
        }
        log::info!("Bridge stopped: {}", bridge.stats());
        result.map(|()| bridge.stats())
    }
}
