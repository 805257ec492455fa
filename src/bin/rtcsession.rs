use rtcsession::{
    config, connection,
    connection::Connection,
    peer::{self, Direction, MediaKind, Transceiver},
    protocol::{Role, RoleParseError},
    qr::QrEncoder,
    rtc::RtcPeer,
    session::{self, Session, SessionOptions},
    signaling::{self, create_signaling, Method, SignalingConfig},
    sink::{Blackhole, MediaSink, Recorder},
    version::get_version,
};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[allow(unused_imports)]
use log::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    ConfigError(#[from] config::Error),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    RoleError(#[from] RoleParseError),

    #[error(transparent)]
    SignalingError(#[from] signaling::Error),

    #[error(transparent)]
    PeerError(#[from] peer::Error),

    #[error(transparent)]
    ConnectionError(#[from] connection::Error),

    #[error(transparent)]
    SessionError(#[from] session::Error),

    #[error("Invalid port {:?}", .0)]
    PortError(String),
}

fn init_logging(args: &clap::ArgMatches) {
    if args.is_present("trace") {
        tracing_subscriber::fmt::init();
        return;
    }
    let level = match args.occurrences_of("verbose") {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(format!("rtcsession={level}")),
    )
    .format(|buf, record| {
        writeln!(
            buf,
            "{} {:<5} {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    })
    .init();
}

fn signaling_config(args: &clap::ArgMatches) -> Result<SignalingConfig, Error> {
    let defaults = SignalingConfig::default();
    let method = match args.value_of("signaling") {
        Some(method) => method.parse::<Method>()?,
        None => defaults.method,
    };
    let port = match args.value_of("signaling-port") {
        Some(port) => port
            .parse::<u16>()
            .map_err(|_| Error::PortError(port.to_string()))?,
        None => defaults.port,
    };
    Ok(SignalingConfig {
        method,
        host: args
            .value_of("signaling-host")
            .map(String::from)
            .unwrap_or(defaults.host),
        port,
        path: args
            .value_of("signaling-path")
            .map(PathBuf::from)
            .unwrap_or(defaults.path),
    })
}

async fn run() -> Result<(), Error> {
    let args = clap::App::new("rtcsession")
        .setting(clap::AppSettings::ArgRequiredElseHelp)
        .before_help("Licensed under the MIT license")
        .version(get_version().as_str())
        .author("Erkki Seppälä <erkki.seppala@vincit.fi>")
        .about(
            "Negotiate a WebRTC media session with a remote party and receive its audio \
	     and video, optionally recording it.",
        )
        .arg(
            clap::Arg::new("role")
                .index(1)
                .required(true)
                .takes_value(true)
                .value_name("ROLE")
                .possible_values(["offer", "answer"])
                .help("Whether to send the offer or wait for one"),
        )
        .arg(
            clap::Arg::new("record-to")
                .long("record-to")
                .takes_value(true)
                .value_name("FILE")
                .help("Write received media to files named after FILE"),
        )
        .arg(
            clap::Arg::new("verbose")
                .long("verbose")
                .short('v')
                .multiple_occurrences(true)
                .help("More logging; repeat for even more"),
        )
        .arg(
            clap::Arg::new("config")
                .long("config")
                .short('c')
                .takes_value(true)
                .value_name("FILE")
                .help(
                    format!(
                        "Config file to load, defaults to {}",
                        config::get_config_file(None)?
                    )
                    .as_str(),
                ),
        )
        .arg(
            clap::Arg::new("signaling")
                .long("signaling")
                .short('s')
                .takes_value(true)
                .possible_values(["copy-and-paste", "tcp-socket", "unix-socket"])
                .help("Signaling method, defaults to copy-and-paste"),
        )
        .arg(
            clap::Arg::new("signaling-host")
                .long("signaling-host")
                .takes_value(true)
                .value_name("HOST")
                .help("Signaling host (tcp-socket only), defaults to 127.0.0.1"),
        )
        .arg(
            clap::Arg::new("signaling-port")
                .long("signaling-port")
                .takes_value(true)
                .value_name("PORT")
                .help("Signaling port (tcp-socket only), defaults to 1234"),
        )
        .arg(
            clap::Arg::new("signaling-path")
                .long("signaling-path")
                .takes_value(true)
                .value_name("PATH")
                .help("Signaling socket path (unix-socket only), defaults to rtcsession.socket"),
        )
        .arg(
            clap::Arg::new("no-qr")
                .long("no-qr")
                .help("Do not show the offer as a QR code"),
        )
        .arg(clap::Arg::new("trace").long("trace").help("Enable tracing"))
        .get_matches();

    init_logging(&args);

    let config_file = config::get_config_file(args.value_of("config"))?;
    let config = config::Config::load(&config_file)?;

    let role: Role = args
        .value_of("role")
        .unwrap_or_default()
        .parse()?;
    let signaling = create_signaling(&signaling_config(&args)?, role);

    let (peer, events) = RtcPeer::new(&config.ice_servers).await?;
    let mut connection = Connection::new(Box::new(peer));
    for kind in [MediaKind::Audio, MediaKind::Video] {
        connection
            .add_transceiver(Transceiver {
                kind,
                direction: Direction::RecvOnly,
            })
            .await?;
    }

    let sink: Box<dyn MediaSink> = match args.value_of("record-to") {
        Some(path) => Box::new(Recorder::new(path)),
        None => Box::new(Blackhole::new()),
    };

    let options = SessionOptions {
        data_channel: config.data_channel.clone(),
        qr: if config.show_qr && !args.is_present("no-qr") {
            Some(QrEncoder::new(config.qr_error_correction))
        } else {
            None
        },
        teardown_timeout: config.teardown_timeout(),
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutting down...");
                    shutdown.cancel();
                }
                Err(err) => warn!("Cannot listen for ^C: {err}"),
            }
        }
    });

    let mut session = Session::new(role, connection, events, signaling, sink, options);
    session.run(shutdown).await?;
    Ok(())
}

fn main() -> Result<(), Error> {
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run());
    // a blocking read of stdin cannot be cancelled
    runtime.shutdown_timeout(Duration::from_millis(100));
    result
}
