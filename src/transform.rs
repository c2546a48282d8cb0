use crate::config::SIMPLE_OBSERVABLE_TYPE;
use crate::error::{MigrateError, Result};
use crate::models::{Bundle, SourceEntity};
use crate::source::SourceApi;
use crate::stage::Stage;
use serde_json::{json, Map, Value};
use tracing::trace;

pub const IDENTITY_TYPE_FIELD: &str = "x_opencti_identity_type";
pub const LOCATION_TYPE_FIELD: &str = "x_opencti_location_type";
const LOCATION_IDENTITY_TYPES: &[&str] = &["Region", "Country", "City"];
const CONTAINER_TYPES: &[&str] = &["report", "note"];

pub fn is_container_type(entity_type: &str) -> bool {
    CONTAINER_TYPES
        .iter()
        .any(|t| t.eq_ignore_ascii_case(entity_type))
}

/// Observable types known to the source platform, each with the STIX
/// key the destination uses for its simple observables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservableKind {
    AutonomousSystem,
    Domain,
    EmailAddress,
    EmailSubject,
    Directory,
    FileName,
    FilePath,
    FileMd5,
    FileSha1,
    FileSha256,
    Ipv4Addr,
    Ipv6Addr,
    MacAddr,
    Mutex,
    PdbPath,
    RegistryKey,
    RegistryKeyValue,
    Url,
    UserAccount,
    UserAgent,
    WindowsServiceName,
    WindowsServiceDisplayName,
    X509CertificateIssuer,
    X509CertificateSerialNumber,
    Text,
    CryptographicKey,
    CryptocurrencyWallet,
}

const OBSERVABLE_TABLE: &[(&str, ObservableKind, &str)] = &[
    ("autonomous-system", ObservableKind::AutonomousSystem, "Autonomous-System.number"),
    ("domain", ObservableKind::Domain, "Domain-Name.value"),
    ("email-address", ObservableKind::EmailAddress, "Email-Addr.value"),
    ("email-subject", ObservableKind::EmailSubject, "Email-Message.subject"),
    ("directory", ObservableKind::Directory, "Directory.path"),
    ("file-name", ObservableKind::FileName, "File.name"),
    ("file-path", ObservableKind::FilePath, "File.name"),
    ("file-md5", ObservableKind::FileMd5, "File.hashes.MD5"),
    ("file-sha1", ObservableKind::FileSha1, "File.hashes.SHA-1"),
    ("file-sha256", ObservableKind::FileSha256, "File.hashes.SHA-256"),
    ("ipv4-addr", ObservableKind::Ipv4Addr, "IPv4-Addr.value"),
    ("ipv6-addr", ObservableKind::Ipv6Addr, "IPv6-Addr.value"),
    ("mac-addr", ObservableKind::MacAddr, "Mac-Addr.value"),
    ("mutex", ObservableKind::Mutex, "Mutex.name"),
    ("pdb-path", ObservableKind::PdbPath, "File.name"),
    ("registry-key", ObservableKind::RegistryKey, "Windows-Registry-Key.key"),
    ("registry-key-value", ObservableKind::RegistryKeyValue, "Windows-Registry-Value-Type.data"),
    ("url", ObservableKind::Url, "Url.value"),
    ("user-account", ObservableKind::UserAccount, "User-Account.account_login"),
    ("user-agent", ObservableKind::UserAgent, "X-OpenCTI-User-Agent.value"),
    ("windows-service-name", ObservableKind::WindowsServiceName, "Process.name"),
    ("windows-service-display-name", ObservableKind::WindowsServiceDisplayName, "Process.display_name"),
    ("x509-certificate-issuer", ObservableKind::X509CertificateIssuer, "X509-Certificate.issuer"),
    ("x509-certificate-serial-number", ObservableKind::X509CertificateSerialNumber, "X509-Certificate.serial_number"),
    ("text", ObservableKind::Text, "X-OpenCTI-Text.value"),
    ("cryptographic-key", ObservableKind::CryptographicKey, "X-OpenCTI-Cryptographic-Key.value"),
    ("cryptocurrency-wallet", ObservableKind::CryptocurrencyWallet, "X-OpenCTI-Cryptocurrency-Wallet.value"),
];

impl ObservableKind {
    pub fn from_entity_type(entity_type: &str) -> Result<Self> {
        OBSERVABLE_TABLE
            .iter()
            .find(|(name, _, _)| name.eq_ignore_ascii_case(entity_type))
            .map(|(_, kind, _)| *kind)
            .ok_or_else(|| MigrateError::UnmappedObservableType(entity_type.to_string()))
    }

    pub fn stix_key(self) -> &'static str {
        OBSERVABLE_TABLE
            .iter()
            .find(|(_, kind, _)| *kind == self)
            .map(|(_, _, key)| *key)
            .unwrap_or_default()
    }
}

/// Whether `entity` is migrated in `stage` at all.
pub fn accepts(stage: Stage, entity: &SourceEntity) -> bool {
    match stage {
        Stage::DomainObjects => !is_container_type(&entity.entity_type),
        Stage::Observables => true,
        Stage::CoreRelationships => !entity.targets_relationship(),
        Stage::RelationshipToRelationship => entity.targets_relationship(),
        Stage::Containers => is_container_type(&entity.entity_type),
    }
}

pub fn strip_labels(objects: &mut [Value]) {
    for object in objects.iter_mut().filter_map(Value::as_object_mut) {
        object.remove("labels");
    }
}

/// Identities standing for places become locations.
pub fn rewrite_location_identities(objects: &mut [Value]) {
    for object in objects.iter_mut().filter_map(Value::as_object_mut) {
        let Some(identity_type) = location_identity_type(object) else {
            continue;
        };
        object.remove(IDENTITY_TYPE_FIELD);
        object.insert("type".to_string(), Value::from("location"));
        if let Some(id) = object.get("id").and_then(Value::as_str) {
            let rewritten = match id.strip_prefix("identity--") {
                Some(rest) => format!("location--{rest}"),
                None => id.to_string(),
            };
            object.insert("id".to_string(), Value::from(rewritten));
        }
        object.insert(LOCATION_TYPE_FIELD.to_string(), Value::from(identity_type));
    }
}

fn location_identity_type(object: &Map<String, Value>) -> Option<String> {
    object
        .get(IDENTITY_TYPE_FIELD)
        .and_then(Value::as_str)
        .filter(|t| LOCATION_IDENTITY_TYPES.contains(t))
        .map(str::to_string)
}

pub fn simple_observable(entity: &SourceEntity) -> Result<Value> {
    let kind = ObservableKind::from_entity_type(&entity.entity_type)?;
    Ok(json!({
        "id": entity.id,
        "type": SIMPLE_OBSERVABLE_TYPE,
        "key": kind.stix_key(),
        "value": entity.observable_value,
        "description": entity.description,
    }))
}

pub fn domain_bundle(mut objects: Vec<Value>) -> Bundle {
    rewrite_location_identities(&mut objects);
    strip_labels(&mut objects);
    Bundle::new(objects)
}

/// Rules shared by observables, relationships and containers.
pub fn plain_bundle(mut objects: Vec<Value>) -> Bundle {
    strip_labels(&mut objects);
    Bundle::new(objects)
}

/// Export `entity` and apply the rules of `stage`. `Ok(None)` means the entity
/// is not migrated in this stage.
///
/// Only the export talks to the source; the rules applied afterwards are pure,
/// so the same exported objects always give the same bundle.
pub async fn build_bundle<S>(source: &S, stage: Stage, entity: &SourceEntity) -> Result<Option<Bundle>>
where
    S: SourceApi + ?Sized,
{
    if !accepts(stage, entity) {
        trace!(id = %entity.id, entity_type = %entity.entity_type, "Skipped for stage");
        return Ok(None);
    }

    let bundle = match stage {
        Stage::DomainObjects => domain_bundle(source.export_object(entity).await?),
        Stage::Observables => {
            let observable = simple_observable(entity)?;
            plain_bundle(source.prepare_export(entity, observable).await?)
        }
        Stage::CoreRelationships | Stage::RelationshipToRelationship | Stage::Containers => {
            plain_bundle(source.export_object(entity).await?)
        }
    };
    Ok(Some(bundle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityRef;
    use chrono::{TimeZone, Utc};

    fn entity(entity_type: &str) -> SourceEntity {
        SourceEntity {
            id: "e-1".to_string(),
            entity_type: entity_type.to_string(),
            created_at: Utc.with_ymd_and_hms(2020, 5, 1, 12, 0, 0).unwrap(),
            observable_value: Some("10.0.0.1".to_string()),
            description: Some("c2 server".to_string()),
            from: None,
            to: None,
        }
    }

    #[test]
    fn country_identity_becomes_location() {
        let bundle = domain_bundle(vec![json!({
            "type": "identity",
            "id": "identity--abc",
            "name": "France",
            "x_opencti_identity_type": "Country",
        })]);
        assert_eq!(
            bundle.objects[0],
            json!({
                "type": "location",
                "id": "location--abc",
                "name": "France",
                "x_opencti_location_type": "Country",
            })
        );
    }

    #[test]
    fn organization_identity_unchanged() {
        let object = json!({
            "type": "identity",
            "id": "identity--def",
            "x_opencti_identity_type": "Organization",
        });
        let bundle = domain_bundle(vec![object.clone()]);
        assert_eq!(bundle.objects[0], object);
    }

    #[test]
    fn labels_removed_from_every_object() {
        let objects = vec![
            json!({"type": "malware", "id": "malware--1", "labels": ["trojan"]}),
            json!({"type": "identity", "id": "identity--2", "labels": [],
                   "x_opencti_identity_type": "City"}),
            json!({"type": "marking-definition", "id": "marking-definition--3"}),
        ];
        for bundle in [domain_bundle(objects.clone()), plain_bundle(objects)] {
            assert!(bundle.objects.iter().all(|o| o.get("labels").is_none()));
        }
    }

    #[test]
    fn rewrite_is_deterministic() {
        let objects = vec![
            json!({"type": "identity", "id": "identity--r", "x_opencti_identity_type": "Region",
                   "labels": ["x"]}),
            json!({"type": "threat-actor", "id": "threat-actor--t"}),
        ];
        assert_eq!(domain_bundle(objects.clone()), domain_bundle(objects));
    }

    #[test]
    fn ipv4_maps_to_stix_key() {
        let object = simple_observable(&entity("ipv4-addr")).unwrap();
        assert_eq!(object["type"], SIMPLE_OBSERVABLE_TYPE);
        assert_eq!(object["key"], "IPv4-Addr.value");
        assert_eq!(object["id"], "e-1");
        assert_eq!(object["value"], "10.0.0.1");
        assert_eq!(object["description"], "c2 server");
    }

    #[test]
    fn unmapped_observable_type_is_fatal() {
        let err = simple_observable(&entity("quantum-entanglement")).unwrap_err();
        assert!(matches!(err, MigrateError::UnmappedObservableType(t) if t == "quantum-entanglement"));
    }

    #[test]
    fn every_table_entry_has_a_key() {
        for (name, kind, key) in OBSERVABLE_TABLE {
            assert_eq!(ObservableKind::from_entity_type(name).unwrap(), *kind);
            assert_eq!(kind.stix_key(), *key);
        }
    }

    #[test]
    fn stage_filters() {
        assert!(accepts(Stage::DomainObjects, &entity("malware")));
        assert!(!accepts(Stage::DomainObjects, &entity("report")));
        assert!(!accepts(Stage::DomainObjects, &entity("Note")));
        assert!(accepts(Stage::Containers, &entity("note")));
        assert!(!accepts(Stage::Containers, &entity("malware")));

        let mut edge = entity("stix_relation");
        edge.from = Some(EntityRef {
            id: "a".to_string(),
            entity_type: "malware".to_string(),
        });
        edge.to = Some(EntityRef {
            id: "b".to_string(),
            entity_type: "attack-pattern".to_string(),
        });
        assert!(accepts(Stage::CoreRelationships, &edge));
        assert!(!accepts(Stage::RelationshipToRelationship, &edge));

        edge.to = Some(EntityRef {
            id: "c".to_string(),
            entity_type: "stix_relation".to_string(),
        });
        assert!(!accepts(Stage::CoreRelationships, &edge));
        assert!(accepts(Stage::RelationshipToRelationship, &edge));
    }
}
