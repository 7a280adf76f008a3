// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::info;
use nats::cli_print_error_chain;
use nats::config::{parse_value, HarnessConfig};
use nats::runner::{plan, run_matrix, MatrixFilter, QemuPlatform};
use test_infra::{Arch, MachineType, PortAllocator};

fn create_app() -> Command {
    Command::new("nats")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Boot guests under a QEMU-compatible monitor and check guest-visible behaviour.")
        .arg(
            Arg::new("scenario")
                .long("scenario")
                .help("Only run this scenario (repeatable)")
                .num_args(1)
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("machine")
                .long("machine")
                .help("Only run on this machine type: pc|q35|virt (repeatable)")
                .num_args(1)
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("distro")
                .long("distro")
                .help("Only run this guest distribution (repeatable)")
                .num_args(1)
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("list")
                .long("list")
                .help("Print the selected instances and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("report")
                .long("report")
                .help("Write a JSON report of every instance to this file")
                .num_args(1),
        )
        .arg(
            Arg::new("monitor")
                .long("monitor")
                .help("Path to the monitor binary")
                .num_args(1),
        )
        .arg(
            Arg::new("workloads")
                .long("workloads")
                .help("Directory holding the source disk images")
                .num_args(1),
        )
        .arg(
            Arg::new("bios")
                .long("bios")
                .help("Firmware passed with -bios (x86_64)")
                .num_args(1),
        )
        .arg(
            Arg::new("flash-firmware")
                .long("flash-firmware")
                .help("Firmware seeding the first pflash image (aarch64)")
                .num_args(1),
        )
        .arg(
            Arg::new("cloud-init")
                .long("cloud-init")
                .help("Directory holding the cloud-init source trees")
                .num_args(1),
        )
        .arg(
            Arg::new("port-base")
                .long("port-base")
                .help("First host port used for guest SSH forwarding")
                .num_args(1),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .help("Per-instance timeout in seconds")
                .num_args(1),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .help("Increase log verbosity"),
        )
}

fn strings(matches: &ArgMatches, id: &str) -> Vec<String> {
    matches
        .get_many::<String>(id)
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}

fn apply_overrides(config: &mut HarnessConfig, matches: &ArgMatches) -> anyhow::Result<()> {
    let path = |id: &str| matches.get_one::<String>(id).map(PathBuf::from);

    if let Some(monitor) = path("monitor") {
        config.monitor_binary = monitor;
    }
    if let Some(workloads) = path("workloads") {
        // The firmware follows the workloads unless it was set explicitly
        if config.bios == config.workloads.join("OVMF.fd") {
            config.bios = workloads.join("OVMF.fd");
        }
        config.workloads = workloads;
    }
    if let Some(bios) = path("bios") {
        config.bios = bios;
    }
    if let Some(firmware) = path("flash-firmware") {
        config.flash_firmware = firmware;
    }
    if let Some(cloud_init) = path("cloud-init") {
        config.cloud_init_dir = cloud_init;
    }
    if let Some(port_base) = matches.get_one::<String>("port-base") {
        config.port_base = parse_value("--port-base", port_base)?;
    }
    if let Some(timeout) = matches.get_one::<String>("timeout") {
        config.timings.instance_timeout =
            Duration::from_secs(parse_value("--timeout", timeout)?);
    }

    Ok(())
}

fn start_nats(matches: &ArgMatches) -> anyhow::Result<bool> {
    let arch = Arch::host();
    let mut config = HarnessConfig::from_env(arch).context("Failed to load configuration")?;
    apply_overrides(&mut config, matches)?;

    let filter = MatrixFilter {
        scenarios: strings(matches, "scenario"),
        machines: strings(matches, "machine")
            .iter()
            .map(|m| m.parse::<MachineType>())
            .collect::<Result<_, _>>()?,
        distros: strings(matches, "distro"),
    };

    let plan = plan(arch, &filter);
    if matches.get_flag("list") {
        for (scenario, machine, distro) in &plan {
            println!("{}/{machine}/{}", scenario.name, distro.name);
        }
        return Ok(true);
    }
    if plan.is_empty() {
        return Err(anyhow!("No instance matches the given filters"));
    }

    info!(
        "Running {} instance(s) on {arch} with {:?}",
        plan.len(),
        config.monitor_binary
    );
    let ports = PortAllocator::new(config.port_base);
    let timings = config.timings;
    let platform = QemuPlatform::new(config);
    let reports = run_matrix(&platform, &ports, arch, &plan, &timings);

    let passed = reports.iter().filter(|r| r.passed).count();
    for report in &reports {
        println!(
            "{:<40} {}",
            report.name,
            if report.passed { "ok" } else { "FAILED" }
        );
        for failure in &report.failures {
            println!("    {failure}");
        }
    }
    println!(
        "\n{passed} passed; {} failed; {} not reported",
        reports.len() - passed,
        plan.len() - reports.len()
    );

    if let Some(path) = matches.get_one::<String>("report") {
        let file = File::create(path).with_context(|| format!("Failed to create {path}"))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &reports)
            .with_context(|| format!("Failed to write report to {path}"))?;
    }

    Ok(passed == plan.len())
}

fn main() {
    let matches = create_app().get_matches();

    let level = match matches.get_count("v") {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match start_nats(&matches) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            cli_print_error_chain(e.as_ref(), "nats");
            process::exit(1);
        }
    }
}
