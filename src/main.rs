// Copyright © 2019 Intel Corporation
// Copyright © 2026 The pKVM IOMMU Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs;
use std::path::Path;
use std::process;

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use pkvm_iommu::cli_print_error_chain;
use pkvm_iommu::config::PlatformConfig;
use pkvm_iommu::platform::Platform;
use vm_device::VmHandle;

fn create_app() -> Command {
    Command::new("pkvm-iommu")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Boot a device assignment platform and report device and stream ownership.")
        .arg_required_else_help(true)
        .arg(
            Arg::new("platform")
                .long("platform")
                .help("Path to the JSON platform description")
                .num_args(1)
                .required(true),
        )
        .arg(
            Arg::new("teardown")
                .long("teardown")
                .help("Tear down guest VM after boot, may be repeated")
                .num_args(1)
                .value_parser(value_parser!(u32))
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("report")
                .long("report")
                .help("Write the report to this file instead of stdout")
                .num_args(1),
        )
}

fn start(cmd_arguments: &ArgMatches) -> anyhow::Result<()> {
    let path = cmd_arguments.get_one::<String>("platform").unwrap();
    let config = PlatformConfig::from_file(Path::new(path))
        .context("Failed to load the platform description")?;

    let mut platform = Platform::boot(config).context("Failed to boot the platform")?;

    if let Some(vms) = cmd_arguments.get_many::<u32>("teardown") {
        for vm in vms {
            platform
                .teardown(VmHandle(*vm))
                .with_context(|| format!("Failed to tear down vm{vm}"))?;
        }
    }

    let report = serde_json::to_string_pretty(&platform.report())
        .context("Failed to serialize the report")?;

    match cmd_arguments.get_one::<String>("report") {
        Some(out) => {
            fs::write(out, report).with_context(|| format!("Failed to write report to {out}"))?
        }
        None => println!("{report}"),
    }

    Ok(())
}

fn main() {
    env_logger::init();

    let cmd_arguments = create_app().get_matches();

    if let Err(e) = start(&cmd_arguments) {
        cli_print_error_chain(&*e, "pkvm-iommu");
        process::exit(1);
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_cli_arguments() {
        let matches = create_app()
            .try_get_matches_from([
                "pkvm-iommu",
                "--platform",
                "/tmp/platform.json",
                "--teardown",
                "1",
                "--teardown",
                "2",
            ])
            .unwrap();

        assert_eq!(
            matches.get_one::<String>("platform").map(String::as_str),
            Some("/tmp/platform.json")
        );
        assert_eq!(
            matches
                .get_many::<u32>("teardown")
                .unwrap()
                .copied()
                .collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(matches.get_one::<String>("report").is_none());
    }

    #[test]
    fn test_cli_requires_platform() {
        assert!(create_app()
            .try_get_matches_from(["pkvm-iommu", "--teardown", "1"])
            .is_err());
    }
}
