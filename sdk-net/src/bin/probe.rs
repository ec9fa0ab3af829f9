//! Connect to a set of nodes, print what was negotiated and exit.

use {
    clap::{crate_version, App, Arg, ArgMatches},
    log::error,
    std::{path::Path, process::exit, time::Duration},
    trv1_sdk_net::{CryptoSuite, Frame, MessageType, Network, SdkNetConfig, SdkNetError},
};

fn config_from_args(matches: &ArgMatches<'_>) -> Result<SdkNetConfig, SdkNetError> {
    let mut config = match matches.value_of("config") {
        Some(path) => SdkNetConfig::from_toml_file(Path::new(path))?,
        None => SdkNetConfig::default(),
    };
    if let Some(peers) = matches.values_of("peer") {
        config.peers = peers.map(str::to_string).collect();
    }
    if let Some(dir) = matches.value_of("cert_dir") {
        config.cert_dir = dir.into();
    }
    match matches.value_of("suite") {
        Some("ecdsa") => config.crypto_suite = Some(CryptoSuite::Ecdsa),
        Some("sm") => config.crypto_suite = Some(CryptoSuite::Sm),
        _ => {}
    }
    config.validate()?;
    Ok(config)
}

fn run(matches: &ArgMatches<'_>) -> Result<(), SdkNetError> {
    let config = config_from_args(matches)?;
    let network = Network::new(config)?;
    let report = network.start()?;
    println!("{report}");
    println!();
    println!("{:<28} {:<12} {:<12} Node", "Peer", "Protocol", "Capability");
    println!("{}", "-".repeat(72));
    for endpoint in network.available_peers() {
        if let Some(protocol) = network.negotiated_protocol(&endpoint) {
            println!(
                "{:<28} {:<12} {:<12} {}",
                endpoint.to_string(),
                protocol.version().to_string(),
                protocol.capability(),
                protocol.node_id().unwrap_or("-"),
            );
        }
    }

    if let Some(payload) = matches.value_of("rpc") {
        let timeout = network.config().request_timeout();
        for endpoint in network.available_peers() {
            let frame = Frame::new(MessageType::RpcRequest, payload.as_bytes().to_vec());
            match network.send_request_sync(&endpoint, frame, timeout) {
                Ok(response) => println!(
                    "\n{endpoint} ({}): {}",
                    response.error_code,
                    String::from_utf8_lossy(&response.payload)
                ),
                Err(e) => println!("\n{endpoint}: {e}"),
            }
        }
    }

    if let Some(secs) = matches.value_of("watch") {
        let secs: u64 = secs
            .parse()
            .map_err(|_| SdkNetError::InvalidConfig(format!("invalid --watch value: {secs}")))?;
        std::thread::sleep(Duration::from_secs(secs));
        println!("\navailable after {secs}s: {:?}", network.available_peers());
    }

    println!("\n{}", network.stats_report());
    network.stop();
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = App::new("trv1-sdk-net-probe")
        .version(crate_version!())
        .about("Connect to TRv1 nodes and report the negotiated protocols")
        .arg(
            Arg::with_name("config")
                .long("config")
                .short("c")
                .value_name("PATH")
                .takes_value(true)
                .help("TOML connection config"),
        )
        .arg(
            Arg::with_name("peer")
                .long("peer")
                .value_name("HOST:PORT")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Node to connect to; overrides the peers of --config"),
        )
        .arg(
            Arg::with_name("cert_dir")
                .long("cert-dir")
                .value_name("DIR")
                .takes_value(true)
                .help("Directory holding the certificate bundles"),
        )
        .arg(
            Arg::with_name("suite")
                .long("suite")
                .takes_value(true)
                .possible_values(&["ecdsa", "sm"])
                .help("Pin a crypto suite instead of falling back"),
        )
        .arg(
            Arg::with_name("rpc")
                .long("rpc")
                .value_name("JSON")
                .takes_value(true)
                .help("JSON-RPC payload to send to every connected peer"),
        )
        .arg(
            Arg::with_name("watch")
                .long("watch")
                .value_name("SECONDS")
                .takes_value(true)
                .help("Keep the network up this long before reporting stats"),
        )
        .get_matches();

    if let Err(e) = run(&matches) {
        error!("{e}");
        exit(1);
    }
}
