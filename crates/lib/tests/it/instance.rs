//! Instance source and resolution tests

use std::{io::Write, sync::Arc};

use keyfleet::instance::{
    InstanceResolver, InstanceState, ResolutionError, StaticInventory, TagFilter,
    TerraformOutputs,
};

fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
}

const INVENTORY: &str = r#"
[[instances]]
id = "i-b"
address = "10.0.1.2"
scope = "us-east-1"
tags = { ssh-provisioning = "enabled" }

[[instances]]
id = "i-a"
address = "10.0.1.1"
scope = "us-east-1"
tags = { ssh-provisioning = "enabled" }

[[instances]]
id = "i-c"
address = "10.0.2.1"
scope = "eu-west-1"
tags = { ssh-provisioning = "enabled" }

[[instances]]
id = "i-stopped"
address = "10.0.1.9"
state = "stopped"
scope = "us-east-1"
tags = { ssh-provisioning = "enabled" }

[[instances]]
id = "i-untagged"
address = "10.0.1.10"
scope = "us-east-1"
"#;

#[tokio::test]
async fn test_inventory_resolution_sorted_and_scoped() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "inventory.toml", INVENTORY);
    let source = Arc::new(StaticInventory::load(&path).await.unwrap());

    let resolution = InstanceResolver::new(source.clone())
        .with_scope(Some("us-east-1".to_string()))
        .resolve()
        .await
        .unwrap();

    let ids: Vec<_> = resolution.instances.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, ["i-a", "i-b"]);
    assert!(!resolution.fallback_used);
    assert!(
        resolution
            .instances
            .iter()
            .all(|i| i.state == InstanceState::Running)
    );
}

#[tokio::test]
async fn test_fallback_uses_every_running_instance_in_scope() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "inventory.toml", INVENTORY);
    let source = Arc::new(StaticInventory::load(&path).await.unwrap());

    let resolution = InstanceResolver::new(source)
        .with_marker(TagFilter::new("team", Some("payments".to_string())))
        .with_scope(Some("us-east-1".to_string()))
        .resolve()
        .await
        .unwrap();

    let ids: Vec<_> = resolution.instances.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, ["i-a", "i-b", "i-untagged"]);
    assert!(resolution.fallback_used);
}

#[tokio::test]
async fn test_no_fallback_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "inventory.toml", INVENTORY);
    let source = Arc::new(StaticInventory::load(&path).await.unwrap());

    let err = InstanceResolver::new(source)
        .with_marker(TagFilter::new("team", None))
        .with_fallback(false)
        .resolve()
        .await
        .unwrap_err();
    assert!(err.is_empty_result());
}

#[tokio::test]
async fn test_empty_scope_is_fatal_even_with_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(&dir, "inventory.toml", INVENTORY);
    let source = Arc::new(StaticInventory::load(&path).await.unwrap());

    let err = InstanceResolver::new(source)
        .with_scope(Some("ap-south-1".to_string()))
        .resolve()
        .await
        .unwrap_err();
    assert!(matches!(err, ResolutionError::NoEligibleInstances { .. }));

    let err: keyfleet::Error = err.into();
    assert!(err.is_fatal());
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_terraform_output_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        &dir,
        "outputs.json",
        r#"{
            "instance_details": {
                "sensitive": false,
                "type": "object",
                "value": {
                    "web-1": {
                        "instance_id": "i-0web1",
                        "private_ip": "10.0.3.1",
                        "public_ip": "54.1.2.3",
                        "instance_type": "t3.micro",
                        "region": "us-east-1",
                        "tags": {"ssh-provisioning": "enabled"}
                    },
                    "db-1": {
                        "instance_id": "i-0db1",
                        "private_ip": "10.0.3.2",
                        "region": "us-east-1",
                        "tags": {}
                    }
                }
            }
        }"#,
    );

    let resolution = InstanceResolver::new(Arc::new(TerraformOutputs::from_file(&path)))
        .resolve()
        .await
        .unwrap();

    assert_eq!(resolution.instances.len(), 1);
    let web = &resolution.instances[0];
    assert_eq!(web.id, "i-0web1");
    assert_eq!(web.address, "10.0.3.1");
    assert_eq!(web.scope.as_deref(), Some("us-east-1"));
    assert_eq!(web.name.as_deref(), Some("web-1"));
}

#[tokio::test]
async fn test_missing_inventory_is_source_error() {
    let dir = tempfile::tempdir().unwrap();
    let source = TerraformOutputs::from_file(dir.path().join("missing.json"));
    let err = InstanceResolver::new(Arc::new(source))
        .resolve()
        .await
        .unwrap_err();
    assert!(err.is_source_error());
}
