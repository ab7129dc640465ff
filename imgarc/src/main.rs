use anyhow::{Result, anyhow, bail};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use imgarc_core::archive::Parsed;
use imgarc_core::config::Config;
use imgarc_core::device::Device;
use imgarc_core::format::{self, Inspection};
use imgarc_core::lzma::{Properties, UNKNOWN_SIZE};
use imgarc_core::write::Outcome;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "imgarc")]
#[command(about = "Image removable disks into 7z/LZMA containers and restore them", version)]
struct Cli {
    /// Read-ahead buffer size in MiB (0 disables read-ahead)
    #[arg(long, global = true, value_name = "MiB")]
    read_buffer: Option<usize>,

    /// Write-behind buffer size in MiB (0 disables write-behind)
    #[arg(long, global = true, value_name = "MiB")]
    write_buffer: Option<usize>,

    /// LZMA dictionary size in MiB
    #[arg(long, global = true, value_name = "MiB")]
    dict_size: Option<u32>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an image to a device interactively
    Write {
        /// Image file to write (.7z or .lzma)
        #[arg(required = true)]
        image: PathBuf,

        /// Skip write verification
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,
    },
    /// Read a device to an image file interactively
    Read {
        /// Output image file (.7z or .lzma)
        #[arg(required = true)]
        image: PathBuf,

        /// Stop at the end of the last MBR partition
        #[arg(short, long)]
        allocated: bool,
    },
    /// Show what an image file contains without writing anything
    Inspect {
        #[arg(required = true)]
        image: PathBuf,
    },
    /// List available removable devices
    List,
}

/// Sets up `env_logger`. `RUST_LOG`, when set, wins over `-v`.
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[Device], prompt: &str) -> Result<Device> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn bar_style(colour: &str) -> Result<ProgressStyle> {
    let template = format!(
        "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{colour}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})"
    );
    Ok(ProgressStyle::default_bar()
        .template(&template)?
        .progress_chars("■ "))
}

fn print_inspection(image: &Path) -> Result<()> {
    println!("  Image: {}", style(image.display()).cyan());
    match format::inspect(image)? {
        Inspection::SevenZip(Parsed::Valid(header)) => {
            println!("  Format:     7z (LZMA)");
            if let Some(name) = &header.name {
                println!("  Entry:      {name}");
            }
            if let Some(modified) = header.modified {
                println!("  Modified:   {}", modified.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            println!("  Unpacked:   {} bytes", header.unpacked_size);
            println!("  Packed:     {} bytes", header.packed_size);
            println!("  Pack CRC:   {:08x}", header.pack_crc);
            match header.unpacked_crc {
                Some(crc) => println!("  Data CRC:   {crc:08x}"),
                None => println!("  Data CRC:   (not recorded)"),
            }
            if let Ok(properties) = Properties::decode(header.coder_properties) {
                println!("  Dictionary: {} bytes", properties.dict_size);
            }
        }
        Inspection::SevenZip(Parsed::Invalid(why)) => {
            bail!("{} is not a valid image: {why}", image.display());
        }
        Inspection::Lzma(Some(header)) => {
            println!("  Format:     LZMA");
            if header.unpacked_size == UNKNOWN_SIZE {
                println!("  Unpacked:   (not recorded)");
            } else {
                println!("  Unpacked:   {} bytes", header.unpacked_size);
            }
            if let Ok(properties) = Properties::decode(header.properties) {
                println!("  Dictionary: {} bytes", properties.dict_size);
            }
        }
        Inspection::Lzma(None) => {
            bail!("{} is not a valid LZMA file", image.display());
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::with_mib(cli.read_buffer, cli.write_buffer, cli.dict_size);
    debug!("using {config:?}");

    match cli.command {
        Commands::Write { image, no_verify } => {
            // Refuse bad images before asking anything about devices.
            print_inspection(&image)?;
            println!();

            let devices = imgarc_core::platform::get_removable_devices()?;
            let device = select_device(&devices, "Select the target device to WRITE to")?;

            println!(
                "{} This will erase all data on '{}' ({:.1} GB).",
                style("WARNING:").red().bold(),
                device.name,
                device.size_gb(),
            );
            println!("  Device: {}", style(device.path.display()).cyan());
            println!("  Image:  {}", style(image.display()).cyan());
            println!();

            if !confirm_operation("Are you sure you want to proceed?")? {
                println!("Write operation cancelled.");
                return Ok(());
            }

            println!();

            let write_pb = ProgressBar::new(0);
            let verify_pb = if !no_verify {
                ProgressBar::new(0)
            } else {
                ProgressBar::hidden()
            };
            let write_style = bar_style("green")?;
            let verify_style = bar_style("magenta")?;

            // These closures connect the core library's progress reporting to our UI.
            let on_write_start = |len| {
                write_pb.set_length(len);
                write_pb.set_prefix("Writing");
                write_pb.set_style(write_style);
            };
            let on_write_progress = |bytes| write_pb.set_position(bytes);

            let on_verify_start = |len| {
                write_pb.finish_with_message("Write complete.");
                verify_pb.set_length(len);
                verify_pb.set_prefix("Verifying");
                verify_pb.set_style(verify_style);
            };
            let on_verify_progress = |bytes| verify_pb.set_position(bytes);

            let result = imgarc_core::write::run(
                &image,
                &device,
                !no_verify,
                &config,
                on_write_start,
                on_write_progress,
                on_verify_start,
                on_verify_progress,
            );

            match result {
                Ok(Outcome::Restored(summary)) => {
                    if !no_verify {
                        verify_pb.finish_with_message("Verification successful.");
                    } else {
                        write_pb.finish_with_message("Write complete (verification skipped).");
                    }
                    println!(
                        "\n✨ Successfully wrote {} bytes to {} from {} (CRC {:08x}).",
                        summary.bytes_written,
                        style(device.path.display()).cyan(),
                        style(image.display()).cyan(),
                        summary.crc,
                    );
                }
                Ok(Outcome::Rejected(why)) => {
                    write_pb.finish_and_clear();
                    verify_pb.finish_and_clear();
                    bail!("{} was not written: {why}", device.path.display());
                }
                Err(e) => {
                    // On error, finish all bars to unblock the terminal.
                    write_pb.finish_with_message("❌ Operation failed.");
                    verify_pb.finish_and_clear();
                    return Err(e);
                }
            }
        }
        Commands::Read { image, allocated } => {
            // Fail on a bad extension before touching any device.
            format::ImageFormat::from_path(&image)?;

            let devices = imgarc_core::platform::get_removable_devices()?;
            let device = select_device(&devices, "Select the source device to READ from")?;

            if allocated {
                println!(
                    "This will read the partitioned part of '{}' ({:.1} GB device).",
                    device.name,
                    device.size_gb()
                );
            } else {
                println!(
                    "This will read {:.1} GB from '{}'.",
                    device.size_gb(),
                    device.name
                );
            }
            println!("  Device: {}", style(device.path.display()).cyan());
            println!("  Output: {}", style(image.display()).cyan());
            println!();

            if !confirm_operation("Are you sure you want to proceed?")? {
                println!("Read operation cancelled.");
                return Ok(());
            }

            println!();

            let read_pb = ProgressBar::new(0);
            let read_style = bar_style("green")?;

            let on_read_start = |len| {
                read_pb.set_length(len);
                read_pb.set_prefix("Reading");
                read_pb.set_style(read_style);
            };
            let on_progress = |bytes| read_pb.set_position(bytes);

            let result = imgarc_core::read::run(
                &device,
                &image,
                allocated,
                &config,
                on_read_start,
                on_progress,
            );

            match result {
                Ok(summary) => {
                    read_pb.finish_with_message("Read complete.");
                    println!(
                        "\n✨ Successfully read {} to {} ({} bytes, {} compressed, CRC {:08x}).",
                        style(device.path.display()).cyan(),
                        style(image.display()).cyan(),
                        summary.unpacked_size,
                        summary.image_size,
                        summary.unpacked_crc,
                    );
                }
                Err(e) => {
                    read_pb.finish_with_message("❌ Operation failed.");
                    return Err(e);
                }
            }
        }
        Commands::Inspect { image } => {
            print_inspection(&image)?;
        }
        Commands::List => {
            let devices = imgarc_core::platform::get_removable_devices()?;
            if devices.is_empty() {
                println!("No removable devices found.");
                return Ok(());
            }

            println!("Found {} removable devices:", devices.len());
            println!(
                "\n  {:<12} {:<25} {:<10} {:<6} {}",
                "DEVICE", "NAME", "SIZE", "BLOCK", "LOCATION"
            );
            println!("  {:-<12} {:-<25} {:-<10} {:-<6} {:-<20}", "", "", "", "", "");
            for device in devices {
                let location = if device.mount_point.is_empty() {
                    "(Not mounted)".to_string()
                } else {
                    device.mount_point.clone()
                };
                println!(
                    "  {:<12} {:<25} {:>8.1} GB {:<6} {}",
                    device.path.display(),
                    device.name,
                    device.size_gb(),
                    device.block_size,
                    location
                );
            }
        }
    }

    Ok(())
}
