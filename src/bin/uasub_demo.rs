//! uasub demo
//!
//! Runs a sample server and a client against it in one process: the client browses the
//! root folder, reads the free-memory variable, resolves the product name by browse
//! path, then monitors free memory for a few seconds before terminating.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use sysinfo::System;
use tracing::{info, warn};

use uasub::node_id::well_known;
use uasub::subscription::{DiscardPolicy, MonitoringParameters, SubscriptionParameters};
use uasub::{
    BuildInfo, ClientSession, DataType, InMemoryAddressSpace, NodeId, Server, ServerConfig, StatusCode,
    SubscriptionEvent, SystemClock, TimestampsToReturn, UaResult, UserIdentity, Variable, Variant,
};

/// Demo configuration
struct Config {
    /// How long the client monitors free memory
    duration: Duration,
    /// Sampling interval of the monitored item
    sampling_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            sampling_interval: Duration::from_millis(100),
        }
    }
}

fn parse_millis(flag: &str, raw: Option<&String>) -> Duration {
    let Some(raw) = raw else {
        eprintln!("error: {flag} requires a value");
        std::process::exit(1);
    };
    let ms: u64 = raw.parse().unwrap_or_else(|_| {
        eprintln!("error: invalid value for {flag}: {raw}");
        std::process::exit(1);
    });
    Duration::from_millis(ms)
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--duration-ms" | "-d" => {
                config.duration = parse_millis("--duration-ms", args.get(i + 1));
                i += 2;
            }
            "--sampling-ms" | "-s" => {
                config.sampling_interval = parse_millis("--sampling-ms", args.get(i + 1));
                i += 2;
            }
            "--help" | "-h" => {
                println!("uasub-demo - sample subscription server and client");
                println!();
                println!("USAGE:");
                println!("    uasub-demo [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -d, --duration-ms <MS>    How long to monitor [default: 10000]");
                println!("    -s, --sampling-ms <MS>    Sampling interval [default: 100]");
                println!("    -h, --help                Print help information");
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    config
}

/// Read accessor for the percentage of physical memory currently available.
fn available_memory() -> impl Fn() -> Result<Variant, StatusCode> + Send + Sync + 'static {
    let sys = Mutex::new(System::new());
    move || {
        let mut sys = sys.lock().map_err(|_| StatusCode::BadInternalError)?;
        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            return Err(StatusCode::BadInternalError);
        }
        Ok(Variant::Double(sys.available_memory() as f64 / total as f64 * 100.0))
    }
}

/// Builds the sample address space. Returns the flag that stops the counter thread.
fn build_address_space(space: &InMemoryAddressSpace) -> UaResult<Arc<AtomicBool>> {
    let device = space.add_object(&well_known::OBJECTS_FOLDER, "MyDevice", None)?;

    let counter = Arc::new(RwLock::new(1.0_f64));
    let read_counter = Arc::clone(&counter);
    space.add_variable(
        &device,
        Variable::builder(space.next_node_id(), "MyVariable1", DataType::Double)
            .getter(move || {
                read_counter
                    .read()
                    .map(|v| Variant::Double(*v))
                    .map_err(|_| StatusCode::BadInternalError)
            })
            .build()?,
    )?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_counter = Arc::clone(&stop);
    thread::spawn(move || {
        while !stop_counter.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(500));
            if let Ok(mut v) = counter.write() {
                *v += 1.0;
            }
        }
    });

    space.add_variable(
        &device,
        Variable::builder(NodeId::parse("ns=1;b=1020FFAA")?, "MyVariable2", DataType::Double)
            .value(Variant::Double(10.0))
            .build()?,
    )?;

    space.add_variable(
        &device,
        Variable::builder(NodeId::string(1, "free_memory"), "FreeMemory", DataType::Double)
            .getter(available_memory())
            .build()?,
    )?;

    Ok(stop)
}

fn run(config: &Config) -> UaResult<()> {
    let server_config = ServerConfig {
        application_name: "MyLittleServer".to_string(),
        build_info: BuildInfo {
            product_name: "MySampleServer1".to_string(),
            build_number: "7658".to_string(),
            build_date: Utc.with_ymd_and_hms(2014, 6, 2, 0, 0, 0).single().unwrap_or_default(),
        },
        ..ServerConfig::default()
    };
    let space = Arc::new(InMemoryAddressSpace::with_build_info(&server_config.build_info));
    let stop_counter = build_address_space(&space)?;

    let server = Arc::new(Server::new(server_config, space, Arc::new(SystemClock::new()))?);
    let timers = server.spawn_timer_thread()?;
    info!("server initialized");

    let session = server.create_session(&UserIdentity::Anonymous)?;
    let client = ClientSession::from(session);
    println!("Session created!");

    println!("References of RootFolder:");
    for child in client.browse(&well_known::ROOT_FOLDER)? {
        println!("   ->  {}", child.browse_name);
    }

    let free_memory = NodeId::string(1, "free_memory");
    println!("----------------------");
    println!("Variable {free_memory}");
    println!("{}", client.read(&free_memory)?);
    println!("----------------------");

    let product_name =
        client.translate_browse_path(&well_known::ROOT_FOLDER, "/Objects/Server.ServerStatus.BuildInfo.ProductName")?;
    println!("Product Name nodeId = {product_name}");

    let subscription = client.subscribe(&SubscriptionParameters {
        publishing_interval: Duration::from_millis(1000),
        lifetime_count: 100,
        max_keep_alive_count: 10,
        max_notifications_per_publish: 100,
        publishing_enabled: true,
        priority: 10,
    })?;

    let item = subscription.monitor(
        &free_memory,
        MonitoringParameters::default()
            .with_sampling_interval(config.sampling_interval)
            .with_queue_size(10)
            .with_discard_policy(DiscardPolicy::DiscardOldest)
            .with_timestamps(TimestampsToReturn::Both),
    )?;

    let deadline = Instant::now() + config.duration;
    while Instant::now() < deadline {
        for event in subscription.events().try_iter() {
            match event {
                SubscriptionEvent::Started { subscription_id } => {
                    println!("subscription started - subscriptionId={subscription_id}");
                }
                SubscriptionEvent::KeepAlive { .. } => println!("keepalive"),
                SubscriptionEvent::Terminated { reason } => println!("terminated ({reason})"),
            }
        }
        match item.changes().recv_timeout(Duration::from_millis(50)) {
            Ok(change) => println!(" value has changed : {}", change.value.value),
            Err(e) if e.is_transport() => break,
            Err(_) => {}
        }
    }

    println!("now terminating subscription");
    subscription.terminate()?;
    for event in subscription.events().try_iter() {
        if let SubscriptionEvent::Terminated { reason } = event {
            println!("terminated ({reason})");
        }
    }

    server.shutdown()?;
    stop_counter.store(true, Ordering::Relaxed);
    timers.stop();
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = parse_args();
    if let Err(e) = run(&config) {
        warn!(error = %e, "demo failed");
        eprintln!("An error has occurred: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_memory_is_a_percentage() {
        let read = available_memory();
        let Variant::Double(pct) = read().unwrap() else {
            panic!("expected a Double");
        };
        assert!((0.0..=100.0).contains(&pct));
    }

    #[test]
    fn sample_space_exposes_free_memory() {
        let space = InMemoryAddressSpace::new();
        let stop = build_address_space(&space).unwrap();
        let node = NodeId::string(1, "free_memory");
        let value = uasub::AddressSpace::resolve(&space, &node).unwrap().read().unwrap();
        assert_eq!(value.data_type(), DataType::Double);
        stop.store(true, Ordering::Relaxed);
    }
}
