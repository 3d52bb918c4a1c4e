use std::collections::BTreeMap;
use std::env;
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::thread;

use anyhow::{Context, Result};
use stepwise_cache::{logging, metrics};

#[derive(Debug, Default)]
pub struct Config {
    pub backtraces: bool,
    pub sentry: bool,
    pub tracing: bool,
    pub metrics: bool,
}

#[derive(Default)]
pub struct Guard {
    _sentry: Option<sentry::ClientInitGuard>,
}

pub fn init(service_config: &stepwise_cache::Config, config: Config) -> Result<Guard> {
    if config.backtraces {
        // SAFETY: called from `main` before the cache spawns any threads.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let mut guard = Guard::default();

    if config.sentry {
        match &service_config.sentry_dsn {
            Some(dsn) => {
                guard._sentry = Some(sentry::init((
                    dsn.clone(),
                    sentry::ClientOptions {
                        release: sentry::release_name!(),
                        traces_sample_rate: 1.0,
                        ..Default::default()
                    },
                )));
            }
            None => tracing::warn!("sentry requested, but no `sentry_dsn` is configured"),
        }
    }

    if config.tracing {
        // we want all the tracing machinery to be active, but not spam the console,
        // so redirect everything into the void. This mimics the production settings.
        logging::init_json_logging("INFO,stepwise_cache=DEBUG", || NoopWriter);
    } else {
        tracing_subscriber::fmt::init();
    }

    if config.metrics {
        let metrics_config = &service_config.metrics;
        let host = match &metrics_config.statsd {
            Some(host) => host.clone(),
            None => spawn_udp_sink()?,
        };

        // have some default tags, just to be closer to the real world config
        let mut tags = BTreeMap::new();
        tags.insert("host".into(), "stresstest".into());
        tags.insert("env".into(), "stresstest".into());
        tags.extend(metrics_config.custom_tags.clone());

        metrics::configure_statsd(&metrics_config.prefix, host, tags)?;
    }

    Ok(guard)
}

/// Binds a local UDP socket that swallows every metric sent to it.
fn spawn_udp_sink() -> Result<String> {
    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let listener = UdpSocket::bind(addr).context("failed to bind metrics sink")?;
    let socket = listener.local_addr()?;

    thread::Builder::new()
        .name("stress-udp-sink".into())
        .spawn(move || {
            let mut buf = [0; 1024];
            while listener.recv(&mut buf).is_ok() {}
        })
        .context("failed to spawn metrics sink")?;

    Ok(format!("127.0.0.1:{}", socket.port()))
}

struct NoopWriter;
impl Write for NoopWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // try to prevent the compiler from optimizing away all the formatting code:
        let buf = std::hint::black_box(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
