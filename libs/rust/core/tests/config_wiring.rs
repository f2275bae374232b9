use arca_core::materializer::JSON;
use arca_core::{Artifact, BackendConfig, Materializer, MaterializerError, Metadata, Registry, RegistryConfig, RegistryError, Version};
use bytes::Bytes;
use serde_json::json;

fn upper_ser(a: &Artifact) -> Result<Bytes, MaterializerError> {
    match a {
        Artifact::Text(s) => Ok(Bytes::from(s.to_uppercase())),
        other => Err(MaterializerError::VariantMismatch { tag: "upper".into(), expected: "text", found: other.kind() }),
    }
}

fn upper_de(b: &[u8]) -> Result<Artifact, MaterializerError> {
    String::from_utf8(b.to_vec())
        .map(Artifact::Text)
        .map_err(|e| MaterializerError::Decode { tag: "upper".into(), message: e.to_string() })
}

#[tokio::test]
async fn yaml_config_builds_a_working_local_registry() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        "backend:\n  kind: local\n  root_path: {:?}\nlock:\n  lease_ms: 5000\n  max_wait_ms: 2000\npurge_payloads: false\n",
        dir.path().display().to_string()
    );
    let cfg = RegistryConfig::from_yaml(&yaml).unwrap();
    assert!(matches!(cfg.backend, BackendConfig::Local { .. }));
    assert_eq!(cfg.lock.lease_ms, 5000);
    assert_eq!(cfg.retry.max_retries, 3);

    let registry = Registry::from_config(&cfg).unwrap();
    let v = registry.push("cfg-test", &Artifact::Json(json!({"ok": true})), Metadata::new(), JSON).await.unwrap();
    assert_eq!(v, Version(1));
    assert_eq!(registry.pull("cfg-test", None).await.unwrap().artifact, Artifact::Json(json!({"ok": true})));
    assert!(dir.path().join("cfg-test/1.payload").is_file());

    registry.delete("cfg-test", Version(1)).await.unwrap();
    // purge disabled: the payload stays until orphans are collected
    assert!(dir.path().join("cfg-test/1.payload").is_file());
}

#[tokio::test]
async fn custom_materializer_round_trips_through_the_registry() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::from_config(&RegistryConfig::local(dir.path())).unwrap();
    registry.register_materializer("upper", Materializer::new(upper_ser, upper_de, "text/plain")).unwrap();

    registry.push("shout", &Artifact::Text("quiet".into()), Metadata::new(), "upper").await.unwrap();
    let pulled = registry.pull("shout", None).await.unwrap();
    assert_eq!(pulled.artifact, Artifact::Text("QUIET".into()));
    assert_eq!(pulled.materializer_type, "upper");

    let err = registry.register_materializer("upper", Materializer::new(upper_ser, upper_de, "text/x-upper")).unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateMaterializer(ref tag) if tag == "upper"));
}

#[test]
fn missing_config_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(RegistryConfig::load(Some(&dir.path().join("absent.yaml"))).is_err());
}
