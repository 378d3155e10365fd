use {
    anyhow::{Context, Result},
    clap::{value_parser, Arg, Command},
    medley::{config, service::Service},
    tokio::signal,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = Command::new("medley")
        .bin_name("medley")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Multi-protocol live media relay server (RTSP/RTMP/HLS).")
        .arg(
            Arg::new("config_file_path")
                .long("config")
                .short('c')
                .value_name("path")
                .help("Specify the configuration file path.")
                .default_value("medley.toml")
                .value_parser(value_parser!(String)),
        );

    let matches = cmd.get_matches();
    let config_path: &String = matches
        .get_one("config_file_path")
        .expect("has a default value");

    let config = config::load(config_path)
        .with_context(|| format!("cannot load configuration from '{config_path}'"))?;

    std::env::set_var("RUST_LOG", &config.log_level);
    env_logger::init();

    let service = Service::start(config).await?;

    signal::ctrl_c().await?;
    service.shutdown().await;

    Ok(())
}
