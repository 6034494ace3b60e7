//! Upload command implementation.

use {
    crate::{
        Cli, CliError, UploadArgs,
        commands::info::load_sketch,
        config::{Config, TransportKind},
        use_fancy_output,
    },
    anyhow::Result,
    console::style,
    indicatif::{ProgressBar, ProgressStyle},
    log::{debug, warn},
    sketchlink::{
        SerialConfig, SerialTransport, TcpConfig, TcpTransport, Transport, UploadConfig, Uploader,
    },
    std::time::Duration,
};

/// Port the stock Wi-Fi bridge sketch listens on.
pub(crate) const DEFAULT_TCP_PORT: u16 = 1111;

/// Build the transport from flags, environment and config files.
fn resolve_transport(args: &UploadArgs, config: &Config) -> Result<Box<dyn Transport>> {
    let connection = &config.connection;
    let kind = args
        .transport
        .or(connection.transport)
        .unwrap_or_default();

    match kind {
        TransportKind::Serial => {
            let port = args
                .port
                .clone()
                .or_else(|| connection.port.clone())
                .ok_or_else(|| {
                    CliError::Usage(
                        "No serial port given; pass --port or set SKETCHLINK_PORT".to_string(),
                    )
                })?;
            let baud = args
                .baud
                .or(connection.baud)
                .unwrap_or(SerialConfig::DEFAULT_BAUD);
            Ok(Box::new(SerialTransport::new(SerialConfig::new(port, baud))))
        },
        TransportKind::Tcp => {
            let host = args
                .host
                .clone()
                .or_else(|| connection.host.clone())
                .ok_or_else(|| {
                    CliError::Usage(
                        "No bridge host given; pass --host or set SKETCHLINK_HOST".to_string(),
                    )
                })?;
            let port = args
                .tcp_port
                .or(connection.tcp_port)
                .unwrap_or(DEFAULT_TCP_PORT);
            let mut tcp = TcpConfig::new(host, port);
            if let Some(secs) = args.connect_timeout_s.or(connection.connect_timeout_s) {
                tcp = tcp.with_connect_timeout(Duration::from_secs(secs));
            }
            Ok(Box::new(TcpTransport::new(tcp)))
        },
    }
}

/// Build the engine settings from flags and config files.
fn resolve_engine(args: &UploadArgs, config: &Config) -> Result<UploadConfig> {
    let upload = &config.upload;
    let mut engine = UploadConfig::default();

    if let Some(ms) = args.ack_timeout_ms.or(upload.ack_timeout_ms) {
        engine = engine.with_ack_timeout(Duration::from_millis(ms));
    }
    if let Some(secs) = args.device_timeout_s.or(upload.device_timeout_s) {
        engine = engine.with_device_timeout_secs(secs);
    }
    if let Some(retries) = args.retries.or(upload.retries) {
        engine = engine.with_max_retries(retries);
    }
    if let Some(ms) = args.retry_delay_ms.or(upload.retry_delay_ms) {
        engine = engine.with_retry_delay(Duration::from_millis(ms));
    }

    engine
        .validate()
        .map_err(|e| CliError::Config(e.to_string()))?;
    Ok(engine)
}

/// Upload command implementation.
pub(crate) fn cmd_upload(cli: &Cli, config: &Config, args: &UploadArgs) -> Result<()> {
    let transport = resolve_transport(args, config)?;
    let engine = resolve_engine(args, config)?;

    let page_size = args
        .page_size
        .or(config.upload.page_size)
        .unwrap_or_else(|| transport.default_page_size());

    if !cli.quiet {
        eprintln!(
            "{} Loading sketch: {}",
            style("📦").cyan(),
            args.sketch.display()
        );
    }
    let sketch = load_sketch(config, &args.sketch, page_size, args.strict_checksum)?;
    let info = sketch.info();

    if !cli.quiet {
        eprintln!(
            "{} {} bytes in {} pages of up to {} bytes (CRC16 {:04X})",
            style("ℹ").blue(),
            info.size,
            info.pages,
            info.bytes_per_page,
            info.crc16
        );
        eprintln!(
            "{} Using {}",
            style("🔌").cyan(),
            style(transport.name()).cyan()
        );
    }

    let name = transport.name().to_string();
    let mut uploader = Uploader::new(transport, engine);

    let token = uploader.cancel_token();
    if let Err(e) = ctrlc::set_handler(move || token.cancel()) {
        warn!("Could not install Ctrl-C handler: {e}");
    }

    let pb = if cli.quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(u64::from(info.pages));
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} pages {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    };

    let result = uploader.upload(&sketch, |done, total| {
        pb.set_length(total as u64);
        pb.set_position(done as u64);
        if done == 0 {
            pb.set_message("waiting for the device");
        } else {
            pb.set_message("");
        }
    });

    let report = match result {
        Ok(report) => {
            pb.finish_with_message("complete");
            report
        },
        Err(sketchlink::Error::Cancelled) => {
            pb.abandon_with_message("cancelled");
            return Err(CliError::Cancelled("Upload cancelled".to_string()).into());
        },
        Err(err) => {
            pb.abandon();
            debug!("Upload ended in phase {:?}", uploader.phase());
            return Err(anyhow::Error::new(err).context(format!("Upload to {name} failed")));
        },
    };

    if !cli.quiet {
        eprintln!(
            "\n{} Uploaded {} bytes in {} pages to {} in {:.1}s ({} resent packets)",
            style("🎉").green().bold(),
            report.size,
            report.pages,
            style(&name).cyan(),
            report.elapsed.as_secs_f64(),
            report.retries
        );
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::Parser;

    fn upload_args(extra: &[&str]) -> UploadArgs {
        let mut argv = vec!["sketchlink", "upload", "Blink.cpp.hex"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            crate::Commands::Upload(args) => args,
            _ => panic!("expected upload"),
        }
    }

    #[test]
    fn test_serial_is_the_default_transport() {
        let args = upload_args(&["--port", "/dev/ttyUSB0"]);
        let transport = resolve_transport(&args, &Config::default()).unwrap();
        assert_eq!(transport.name(), "/dev/ttyUSB0");
    }

    #[test]
    fn test_serial_without_port_is_a_usage_error() {
        let mut args = upload_args(&[]);
        // Ignore SKETCHLINK_PORT from the environment running the tests
        args.port = None;
        let err = resolve_transport(&args, &Config::default()).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
    }

    #[test]
    fn test_tcp_uses_config_host_and_default_port() {
        let mut args = upload_args(&["--transport", "tcp"]);
        args.host = None;
        args.tcp_port = None;

        let mut config = Config::default();
        config.connection.host = Some("bridge.local".to_string());

        let transport = resolve_transport(&args, &config).unwrap();
        assert_eq!(transport.name(), "bridge.local:1111");
    }

    #[test]
    fn test_flag_overrides_config() {
        let mut config = Config::default();
        config.connection.transport = Some(TransportKind::Tcp);
        config.connection.host = Some("from-config".to_string());

        let args = upload_args(&["--host", "from-flag", "--tcp-port", "2222"]);
        let transport = resolve_transport(&args, &config).unwrap();
        assert_eq!(transport.name(), "from-flag:2222");
    }

    #[test]
    fn test_engine_settings_merge() {
        let mut config = Config::default();
        config.upload.retries = Some(4);
        config.upload.ack_timeout_ms = Some(1500);

        let mut args = upload_args(&["--retry-delay-ms", "50", "--device-timeout-s", "9"]);
        args.retries = None;
        let engine = resolve_engine(&args, &config).unwrap();

        assert_eq!(engine.max_retries, 4);
        assert_eq!(engine.ack_timeout, Duration::from_millis(1500));
        assert_eq!(engine.retry_delay, Duration::from_millis(50));
        assert_eq!(engine.device_timeout_secs, 9);
        assert_eq!(engine.protocol_version, 1);
    }

    #[test]
    fn test_zero_retries_is_a_config_error() {
        let args = upload_args(&["--retries", "0"]);
        let err = resolve_engine(&args, &Config::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Config(_))
        ));
    }
}
