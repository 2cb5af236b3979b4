// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Unit tests for tikv-operator.
//!
//! These tests run without a Kubernetes cluster or a PD server and test
//! individual components through the public API.

use std::collections::BTreeMap;

use tikv_operator::crd::{PdSpec, ResourceRequirementsSpec, TikvCluster, TikvClusterSpec, TikvSpec};

fn storage(size: &str) -> ResourceRequirementsSpec {
    ResourceRequirementsSpec {
        requests: BTreeMap::from([("storage".to_string(), size.to_string())]),
        ..Default::default()
    }
}

fn test_cluster() -> TikvCluster {
    let mut tc = TikvCluster::new(
        "basic",
        TikvClusterSpec {
            version: "v4.0.0".to_string(),
            pd: PdSpec {
                replicas: 3,
                base_image: "pingcap/pd".to_string(),
                resources: storage("1Gi"),
                ..Default::default()
            },
            tikv: TikvSpec {
                replicas: 3,
                base_image: "pingcap/tikv".to_string(),
                resources: storage("10Gi"),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    tc.metadata.namespace = Some("tidb".to_string());
    tc.metadata.uid = Some("uid-basic".to_string());
    tc
}

mod naming_tests {
    use tikv_operator::crd::MemberType;
    use tikv_operator::resources::common::{
        discovery_name, member_name, ordinal_from_name, ordinal_pod_name, peer_member_name,
        pvc_name,
    };
    use tikv_operator::resources::labels::{
        COMPONENT_KEY, INSTANCE_KEY, Label, MANAGED_BY_KEY, NAME_KEY,
    };

    #[test]
    fn test_object_names() {
        assert_eq!(member_name("basic", MemberType::Pd), "basic-pd");
        assert_eq!(member_name("basic", MemberType::Tikv), "basic-tikv");
        assert_eq!(peer_member_name("basic", MemberType::Pd), "basic-pd-peer");
        assert_eq!(discovery_name("basic"), "basic-discovery");
        assert_eq!(ordinal_pod_name("basic", MemberType::Tikv, 2), "basic-tikv-2");
        assert_eq!(pvc_name(MemberType::Pd, "basic-pd-0"), "pd-basic-pd-0");
    }

    #[test]
    fn test_ordinal_from_name() {
        assert_eq!(ordinal_from_name("basic-tikv-12"), Some(12));
        assert_eq!(ordinal_from_name("tikv-basic-tikv-0"), Some(0));
        assert_eq!(ordinal_from_name("basic-tikv"), None);
    }

    #[test]
    fn test_label_builder() {
        let labels = Label::new().instance("basic").pd().into_labels();
        assert_eq!(labels[NAME_KEY], "tikv-cluster");
        assert_eq!(labels[MANAGED_BY_KEY], "tikv-operator");
        assert_eq!(labels[INSTANCE_KEY], "basic");
        assert_eq!(labels[COMPONENT_KEY], "pd");

        let selector = Label::new().instance("basic").tikv().selector();
        assert!(selector.contains("app.kubernetes.io/component=tikv"));
        assert!(selector.contains("app.kubernetes.io/instance=basic"));
    }
}

mod ordinal_tests {
    use std::collections::BTreeSet;

    use tikv_operator::crd::{ANN_TIKV_DELETE_SLOTS, MemberType, pod_ordinals_from_replicas_and_delete_slots};
    use tikv_operator::manager::pd_upgrader::upgrade_order;
    use tikv_operator::manager::scaler::{ScaleStep, next_scale_step};
    use tikv_operator::manager::tikv_member_manager::parse_store_address;

    use super::test_cluster;

    fn set(values: &[i32]) -> BTreeSet<i32> {
        values.iter().copied().collect()
    }

    #[test]
    fn test_ordinals_skip_delete_slots() {
        assert_eq!(pod_ordinals_from_replicas_and_delete_slots(3, &set(&[1])), set(&[0, 2, 3]));
        assert_eq!(pod_ordinals_from_replicas_and_delete_slots(0, &set(&[0])), set(&[]));
        assert_eq!(pod_ordinals_from_replicas_and_delete_slots(-1, &set(&[])), set(&[]));
    }

    #[test]
    fn test_desired_ordinals_from_annotation() {
        let mut tc = test_cluster();
        tc.metadata.annotations = Some(
            [(ANN_TIKV_DELETE_SLOTS.to_string(), "[0, 2]".to_string())]
                .into_iter()
                .collect(),
        );
        assert_eq!(tc.sts_desired_ordinals(MemberType::Tikv, false), set(&[1, 3, 4]));
        assert_eq!(tc.sts_desired_ordinals(MemberType::Pd, false), set(&[0, 1, 2]));
    }

    #[test]
    fn test_scale_steps_walk_to_desired() {
        let desired = set(&[0, 1]);
        let mut current = set(&[0, 1, 2, 3]);
        let mut steps = Vec::new();
        loop {
            match next_scale_step(&current, &desired) {
                ScaleStep::Out(o) => {
                    current.insert(o);
                    steps.push(ScaleStep::Out(o));
                }
                ScaleStep::In(o) => {
                    current.remove(&o);
                    steps.push(ScaleStep::In(o));
                }
                ScaleStep::None => break,
            }
        }
        assert_eq!(steps, vec![ScaleStep::In(3), ScaleStep::In(2)]);
        assert_eq!(current, desired);
    }

    #[test]
    fn test_upgrade_order() {
        assert_eq!(upgrade_order(&set(&[0, 1, 2]), Some(1)), vec![0, 2, 1]);
        assert_eq!(upgrade_order(&set(&[0, 2, 3]), None), vec![0, 2, 3]);
    }

    #[test]
    fn test_parse_store_address() {
        let (ip, pod) = parse_store_address("basic-tikv-0.basic-tikv-peer.tidb.svc:20160");
        assert_eq!(ip, "basic-tikv-0.basic-tikv-peer.tidb.svc");
        assert_eq!(pod, "basic-tikv-0");
    }
}

mod validation_tests {
    use std::collections::BTreeMap;

    use tikv_operator::controller::validation::{FieldErrorKind, aggregate_message, validate_cluster};
    use tikv_operator::crd::ANN_PD_DELETE_SLOTS;

    use super::test_cluster;

    #[test]
    fn test_valid_cluster() {
        let tc = test_cluster();
        assert!(validate_cluster(&tc).is_empty());
    }

    #[test]
    fn test_replicas_and_storage() {
        let mut tc = test_cluster();
        tc.spec.pd.replicas = 0;
        tc.spec.tikv.resources.requests.clear();

        let errors = validate_cluster(&tc);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].field, "spec.pd.replicas");
        assert_eq!(errors[1].kind, FieldErrorKind::Required);

        let message = aggregate_message(&errors);
        assert!(message.starts_with('['));
        assert!(message.contains("spec.pd.replicas"));
        assert!(message.contains("spec.tikv.requests.storage[storage]"));
    }

    #[test]
    fn test_bad_annotation_key() {
        let mut tc = test_cluster();
        tc.metadata.annotations = Some(BTreeMap::from([("-bad".to_string(), "x".to_string())]));
        let errors = validate_cluster(&tc);
        assert!(!errors.is_empty());
        assert!(errors.iter().all(|e| e.field == "metadata.annotations"));
    }

    #[test]
    fn test_pd_delete_slot_in_range_rejected() {
        let mut tc = test_cluster();
        tc.metadata.annotations = Some(BTreeMap::from([(
            ANN_PD_DELETE_SLOTS.to_string(),
            "[0]".to_string(),
        )]));
        let errors = validate_cluster(&tc);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, FieldErrorKind::Invalid);
        assert!(aggregate_message(&errors).contains("pd.tikv.org/delete-slots"));
    }
}

mod defaulting_tests {
    use tikv_operator::controller::defaulting::{DEFAULT_MAX_FAILOVER_COUNT, set_defaults};

    use super::test_cluster;

    #[test]
    fn test_defaults_fill_unset_fields_only() {
        let mut tc = test_cluster();
        tc.spec.pd.base_image.clear();
        tc.spec.tikv.max_failover_count = Some(0);
        set_defaults(&mut tc);

        assert_eq!(tc.spec.pd.base_image, "pingcap/pd");
        assert_eq!(tc.spec.tikv.base_image, "pingcap/tikv");
        assert_eq!(tc.spec.pd.max_failover_count, Some(DEFAULT_MAX_FAILOVER_COUNT));
        assert_eq!(tc.spec.tikv.max_failover_count, Some(0));
        assert_eq!(tc.image_pull_policy(), "IfNotPresent");
        assert_eq!(tc.pd_image(), "pingcap/pd:v4.0.0");
    }
}

mod error_tests {
    use tikv_operator::controller::error::Error;

    #[test]
    fn test_error_classification() {
        let kube_err = Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "timeout".to_string(),
            reason: "Timeout".to_string(),
            code: 504,
        }));
        assert!(kube_err.is_retryable());
        assert!(!kube_err.is_requeue());

        let conflict = Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }));
        assert!(conflict.is_conflict());

        assert!(!Error::Validation("invalid spec".to_string()).is_retryable());
        assert!(Error::Requeue("waiting".to_string()).is_requeue());
    }

    #[test]
    fn test_aggregate() {
        assert!(Error::aggregate(Vec::new()).is_ok());

        let single = Error::aggregate(vec![Error::Transient("pd down".to_string())]).unwrap_err();
        assert!(matches!(single, Error::Transient(_)));

        let requeues = Error::aggregate(vec![
            Error::Requeue("a".to_string()),
            Error::Requeue("b".to_string()),
        ])
        .unwrap_err();
        assert!(requeues.is_requeue());
        assert_eq!(requeues.to_string(), "[a, b]");

        let mixed = Error::aggregate(vec![
            Error::Requeue("a".to_string()),
            Error::Transient("b".to_string()),
        ])
        .unwrap_err();
        assert!(!mixed.is_requeue());
        assert!(mixed.is_retryable());
    }
}

mod condition_tests {
    use tikv_operator::controller::condition::{
        REASON_STATEFULSET_NOT_UP_TO_DATE, derive_ready_condition, status_equal_ignoring_heartbeats,
        update_ready_condition,
    };
    use tikv_operator::crd::{StatefulSetStatusSnapshot, StoreState, TikvStore};

    use super::test_cluster;

    #[test]
    fn test_missing_statefulsets_are_not_up_to_date() {
        let tc = test_cluster();
        let condition = derive_ready_condition(&tc);
        assert_eq!(condition.status, "False");
        assert_eq!(condition.reason, REASON_STATEFULSET_NOT_UP_TO_DATE);
        assert!(condition.last_transition_time.is_none());
    }

    #[test]
    fn test_update_sets_times_once() {
        let mut tc = test_cluster();
        assert!(update_ready_condition(&mut tc, "2020-05-01T10:00:00Z"));
        assert!(!update_ready_condition(&mut tc, "2020-05-01T10:01:00Z"));
        let condition = &tc.status_ref().conditions[0];
        assert_eq!(condition.last_transition_time.as_deref(), Some("2020-05-01T10:00:00Z"));
    }

    #[test]
    fn test_heartbeats_are_ignored() {
        let mut tc = test_cluster();
        let status = tc.status.get_or_insert_with(Default::default);
        status.tikv.stateful_set = Some(StatefulSetStatusSnapshot::default());
        status.tikv.stores.insert(
            "1".to_string(),
            TikvStore {
                id: "1".to_string(),
                state: StoreState::Up,
                last_heartbeat_time: "2020-05-01T10:00:00Z".to_string(),
                ..Default::default()
            },
        );
        let before = tc.status_ref();
        let mut after = before.clone();
        after.tikv.stores.get_mut("1").unwrap().last_heartbeat_time = "2020-05-01T10:00:10Z".to_string();
        assert!(status_equal_ignoring_heartbeats(&before, &after));

        after.tikv.stores.get_mut("1").unwrap().state = StoreState::Down;
        assert!(!status_equal_ignoring_heartbeats(&before, &after));
    }
}

mod config_tests {
    use std::time::Duration;

    use clap::Parser;
    use tikv_operator::controller::config::ControllerConfig;

    #[test]
    fn test_flags_override_defaults() {
        let config = ControllerConfig::try_parse_from([
            "tikv-operator",
            "--workers",
            "2",
            "--pd-failover-period",
            "10m",
            "--namespace",
            "tidb",
        ])
        .unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.pd_failover_period, Duration::from_secs(600));
        assert_eq!(config.namespace.as_deref(), Some("tidb"));
        assert!(config.auto_failover);
    }
}

mod retry_tests {
    use std::time::Duration;

    use tikv_operator::controller::error::Error;
    use tikv_operator::controller::tikv_cluster_controller::{MAX_RETRY_DELAY, backoff_delay};

    #[test]
    fn test_backoff_is_capped() {
        let base = Duration::from_millis(5);
        let max = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, max, 0), base);
        assert_eq!(backoff_delay(base, max, 3), Duration::from_millis(40));
        assert_eq!(backoff_delay(base, max, 40), max);
    }

    #[test]
    fn test_requeue_retries_sooner_than_failures() {
        let requeue = tikv_operator::requeue!("waiting for store 4 to become Tombstone");
        let transient = Error::Transient("connection refused".to_string());
        let invalid = Error::Validation("replicas must be at least 1".to_string());
        assert!(requeue.requeue_after() < transient.requeue_after());
        assert!(transient.requeue_after() < invalid.requeue_after());
        assert!(invalid.requeue_after() < MAX_RETRY_DELAY);
    }
}

mod resource_tests {
    use tikv_operator::crd::MemberType;
    use tikv_operator::resources::configmap::{CONFIG_FILE_KEY, STARTUP_SCRIPT_KEY, generate_configmap};
    use tikv_operator::resources::services::{
        PD_CLIENT_PORT, PD_PEER_PORT, generate_pd_service, generate_peer_service,
    };
    use tikv_operator::resources::statefulset::{generate_tikv_statefulset, statefulset_replicas};

    use super::test_cluster;

    #[test]
    fn test_objects_are_owned_by_cluster() {
        let tc = test_cluster();
        let svc = generate_pd_service(&tc);
        let owner = &svc.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "TikvCluster");
        assert_eq!(owner.name, "basic");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn test_services() {
        let tc = test_cluster();
        let svc = generate_pd_service(&tc);
        assert_eq!(svc.metadata.name.as_deref(), Some("basic-pd"));
        assert_eq!(svc.spec.as_ref().unwrap().ports.as_ref().unwrap()[0].port, PD_CLIENT_PORT);

        let peer = generate_peer_service(&tc, MemberType::Pd);
        let spec = peer.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
        assert_eq!(spec.ports.unwrap()[0].port, PD_PEER_PORT);
    }

    #[test]
    fn test_configmap_carries_config_and_script() {
        let tc = test_cluster();
        let cm = generate_configmap(&tc, MemberType::Tikv);
        let data = cm.data.unwrap();
        assert!(data.contains_key(CONFIG_FILE_KEY));
        assert!(data[STARTUP_SCRIPT_KEY].contains("tikv-server"));
    }

    #[test]
    fn test_tikv_statefulset() {
        let tc = test_cluster();
        let sts = generate_tikv_statefulset(&tc, "basic-tikv");
        assert_eq!(sts.metadata.name.as_deref(), Some("basic-tikv"));
        assert_eq!(statefulset_replicas(&sts), 3);
        let spec = sts.spec.unwrap();
        assert_eq!(spec.service_name.as_deref(), Some("basic-tikv-peer"));
        assert_eq!(spec.update_strategy.unwrap().type_.as_deref(), Some("OnDelete"));
        let claims = spec.volume_claim_templates.unwrap();
        assert_eq!(claims[0].metadata.name.as_deref(), Some("tikv"));
    }
}
