// Copyright (C) 2023 Intel Corporation
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use bootfuzz::{
    configuration::{Delivery, HarnessConfiguration},
    hypercall::{Opcode, SubmitMode},
    interrupts::{Exception, FaultPolicy},
    logger::{HypercallLogger, MESSAGE_SIZE},
};
use log::{Level, LevelFilter, Log, Record};
use tests::MockHypervisor;

#[test]
fn test_partial_configuration_uses_defaults() -> Result<()> {
    let configuration: HarnessConfiguration = serde_json::from_str(
        r#"{
            "coverage": { "start": 31744, "end": 65536, "flags": 0 },
            "delivery": "RawBuffer",
            "submit_mode": "Bits16",
            "fault_policy": { "fatal": 16384 }
        }"#,
    )?;

    assert_eq!(configuration.coverage().start, 0x7c00);
    assert_eq!(configuration.delivery(), Delivery::RawBuffer);
    assert_eq!(configuration.submit_mode(), SubmitMode::Bits16);
    assert_eq!(
        configuration.fault_policy(),
        FaultPolicy::none().with_fatal(Exception::PageFault)
    );

    let defaults = HarnessConfiguration::default();
    assert_eq!(configuration.drive_number(), defaults.drive_number());
    assert_eq!(configuration.identity_map(), defaults.identity_map());
    assert_eq!(configuration.host_magic(), defaults.host_magic());

    let reparsed: HarnessConfiguration =
        serde_json::from_str(&serde_json::to_string(&configuration)?)?;
    assert_eq!(reparsed, configuration);

    Ok(())
}

#[test]
fn test_logger_formats_through_printf() {
    let hypervisor = MockHypervisor::builder().build().leak();
    let logger = HypercallLogger::new(hypervisor, LevelFilter::Info);

    logger.log(
        &Record::builder()
            .level(Level::Info)
            .target("bootfuzz::driver")
            .args(format_args!("Initialized with {} pages", 4096))
            .build(),
    );
    logger.log(
        &Record::builder()
            .level(Level::Debug)
            .target("bootfuzz::driver")
            .args(format_args!("filtered"))
            .build(),
    );

    assert_eq!(
        hypervisor.printed(),
        vec!["[INFO] bootfuzz::driver: Initialized with 4096 pages\n".to_string()]
    );
}

#[test]
fn test_long_messages_are_truncated() {
    let hypervisor = MockHypervisor::builder().build().leak();
    let logger = HypercallLogger::new(hypervisor, LevelFilter::Trace);
    let long = "x".repeat(MESSAGE_SIZE * 2);

    logger.log(
        &Record::builder()
            .level(Level::Warn)
            .target("t")
            .args(format_args!("{long}"))
            .build(),
    );

    let printed = hypervisor.printed();
    assert_eq!(printed.len(), 1);
    assert_eq!(printed[0].len(), MESSAGE_SIZE - 1);
    assert!(printed[0].starts_with("[WARN] t: xxx"));
    assert_eq!(hypervisor.count(Opcode::Printf), 1);
}
