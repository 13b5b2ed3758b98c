use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use iboot_lib::cipher;
use iboot_lib::constants::PRODUCT_CODE_RECEIVER;
use iboot_lib::gateway::format_node_time;
use iboot_lib::{
    FakeDevice, FirmwareArchive, FirmwareImage, GatewayClient, GatewayConfig, GatewayTransport,
    LoggingTransport, UpdateError, UploadOutcome, Uploader,
};

/// Firmware update client for PE-series pool and spa controllers.
#[derive(Parser, Debug)]
#[command(name = "iboot", version, about, long_about = None)]
struct Cli {
    /// Verbose protocol logging
    #[arg(short = 'd', long = "debug", global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decrypt an archive and write the plaintext to stdout
    Decrypt { file: PathBuf },

    /// List the products and firmware images contained in an archive
    Describe {
        file: PathBuf,
        /// Write each product image as Intel-HEX next to the archive
        #[arg(long)]
        write_ihex: bool,
        /// Write each product image as raw bytes next to the archive
        #[arg(long)]
        write_bin: bool,
    },

    /// Upload the receiver image to the in-process device simulator
    FakeUpload { file: PathBuf },

    /// Upload firmware to a device through a Z-Wave gateway
    Upload {
        file: PathBuf,
        node_id: u8,
        mqtt_url: String,
        api_topic: String,
    },

    /// Read the controller clock over the gateway
    GetTime {
        node_id: u8,
        mqtt_url: String,
        api_topic: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(command: Command) -> Result<ExitCode> {
    match command {
        Command::Decrypt { file } => {
            let ciphertext = read_file(&file)?;
            let plaintext = cipher::decrypt_archive(&ciphertext)?;
            io::stdout().write_all(&plaintext)?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Describe {
            file,
            write_ihex,
            write_bin,
        } => {
            let archive = load_archive(&file)?;
            describe(&file, &archive, write_ihex, write_bin)?;
            Ok(ExitCode::SUCCESS)
        }

        Command::FakeUpload { file } => {
            let archive = load_archive(&file)?;
            let image = receiver_image(&archive)?;
            info!("uploading to the in-process simulator");
            let mut uploader = Uploader::new(LoggingTransport::new(FakeDevice::new()));
            let outcome = uploader.upload(image).await?;
            Ok(report_outcome(outcome))
        }

        Command::Upload {
            file,
            node_id,
            mqtt_url,
            api_topic,
        } => {
            let archive = load_archive(&file)?;
            let client = GatewayClient::connect(&GatewayConfig {
                mqtt_url,
                api_topic,
                node_id,
            })
            .await?;

            let node = client.node_info().await?;
            let code = node.product_code()?;
            let product = archive.product(code).ok_or_else(|| {
                UpdateError::UnsupportedNode(format!("archive has no entry for {code}"))
            })?;
            let image = product.image().ok_or_else(|| {
                UpdateError::UnsupportedNode(format!("archive has no image for {code}"))
            })?;

            println!("Node {node_id}: {code} ({})", product.name);
            if let Some(version) = &node.firmware_version {
                println!("  installed firmware: {version}");
            }
            println!("  archive firmware:   {}", product.version);
            println!("  image: {} bytes, sha256 {}", image.len(), image.sha256());
            if !product.message.is_empty() {
                println!("  note: {}", product.message);
            }
            println!("A failed update can leave the device unusable.");
            confirm()?;

            let mut uploader = Uploader::new(LoggingTransport::new(GatewayTransport::new(client)));
            let outcome = uploader.upload(image).await?;
            Ok(report_outcome(outcome))
        }

        Command::GetTime {
            node_id,
            mqtt_url,
            api_topic,
        } => {
            let client = GatewayClient::connect(&GatewayConfig {
                mqtt_url,
                api_topic,
                node_id,
            })
            .await?;
            let reply = client
                .send_command(&[])
                .await?
                .context("no reply from the node")?;
            debug!("diagnostic reply: {reply:02X?}");
            println!("{}", format_node_time(&reply)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn load_archive(path: &Path) -> Result<FirmwareArchive> {
    let ciphertext = read_file(path)?;
    let archive = FirmwareArchive::decrypt_and_parse(&ciphertext)?;
    info!(
        "archive version {}, {} product(s)",
        archive.format_version,
        archive.products.len()
    );
    Ok(archive)
}

fn describe(
    path: &Path,
    archive: &FirmwareArchive,
    write_ihex: bool,
    write_bin: bool,
) -> Result<()> {
    println!("archive version: {}", archive.format_version);

    let mut codes: Vec<&String> = archive.products.keys().collect();
    codes.sort();
    for code in codes {
        let product = &archive.products[code];
        println!("{code}: {} {}", product.name, product.version);
        if !product.message.is_empty() {
            println!("  message: {}", product.message);
        }
        match product.image() {
            Some(image) => {
                println!("  image: {} bytes, sha256 {}", image.len(), image.sha256());
                if write_ihex {
                    let out = path.with_extension(format!("{code}.ihex"));
                    fs::write(&out, image.to_ihex())
                        .with_context(|| format!("failed to write {}", out.display()))?;
                    println!("  wrote {}", out.display());
                }
                if write_bin {
                    let out = path.with_extension(format!("{code}.bin"));
                    fs::write(&out, image.data())
                        .with_context(|| format!("failed to write {}", out.display()))?;
                    println!("  wrote {}", out.display());
                }
            }
            None => println!("  image: none"),
        }
    }
    Ok(())
}

fn receiver_image(archive: &FirmwareArchive) -> Result<&FirmwareImage> {
    let product = archive.product(PRODUCT_CODE_RECEIVER).ok_or_else(|| {
        UpdateError::UnsupportedNode(format!("archive has no entry for {PRODUCT_CODE_RECEIVER}"))
    })?;
    let image = product.image().ok_or_else(|| {
        UpdateError::UnsupportedNode(format!("archive has no image for {PRODUCT_CODE_RECEIVER}"))
    })?;
    Ok(image)
}

fn confirm() -> Result<()> {
    print!("Proceed? [Enter \"YES\" to confirm] ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    if answer.trim_end_matches(['\r', '\n']) != "YES" {
        return Err(UpdateError::UserDeclined.into());
    }
    Ok(())
}

fn report_outcome(outcome: UploadOutcome) -> ExitCode {
    match outcome {
        UploadOutcome::Confirmed => {
            println!("Upload confirmed by the device.");
            ExitCode::SUCCESS
        }
        UploadOutcome::Unconfirmed => {
            // The device family loses the final DONE reply in transit;
            // surface the ambiguity through the exit code.
            println!("Upload finished without final confirmation; the image is assumed to be in place.");
            ExitCode::FAILURE
        }
    }
}
