// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;

use crate::{CadenceGroup, DataType, UpstreamError};

#[test]
fn cadence_groups_partition_the_data_types() {
    let mut seen = HashSet::new();
    for group in CadenceGroup::ALL {
        for dt in group.data_types() {
            assert!(seen.insert(dt), "{dt} appears in more than one cadence group");
        }
    }
    assert_eq!(seen.len(), DataType::ALL.len());
}

#[test]
fn wire_names_round_trip() {
    for dt in DataType::ALL {
        assert_eq!(dt.as_str().parse::<DataType>(), Ok(dt));
        // The serde form matches the wire name.
        let json = serde_json::to_string(&dt).unwrap();
        assert_eq!(json, format!("\"{}\"", dt.as_str()));
    }
}

#[test]
fn unknown_wire_name_is_rejected() {
    assert!("conveyorLifts".parse::<DataType>().is_err());
}

#[test]
fn failure_accounting_classification() {
    assert!(UpstreamError::Down("unreachable".to_owned()).counts_as_failure());
    assert!(UpstreamError::Timeout.counts_as_failure());
    assert!(!UpstreamError::Decode("bad json".to_owned()).counts_as_failure());
    assert!(!UpstreamError::Transient("eof".to_owned()).counts_as_failure());
}
