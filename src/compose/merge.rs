//! Multi-document merge.
//!
//! Folds an ordered list of parsed documents into a single [`Composition`].
//! Later documents override earlier ones per key: scalars replace, maps
//! take a shallow union with later keys winning, sequences concatenate with
//! duplicates preserved, health probes replace wholesale, and dependency
//! readiness levels are promoted (`started < healthy`). The extension
//! block's keys are each last-wins; the legacy/new storage key
//! mutual-exclusion check runs after the fold so it also catches keys
//! spread across documents.

use super::graph::Composition;
use super::types::{ClusterImageStorage, ComposeFile, ComposeService, Readiness, XKubeCompose};
use crate::error::{Error, Result};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use tracing::debug;

/// Merges parsed documents, in order, into a composition.
pub fn merge(docs: Vec<ComposeFile>) -> Result<Composition> {
    let mut services: BTreeMap<String, ComposeService> = BTreeMap::new();
    let mut extension = XKubeCompose::default();
    for doc in docs {
        debug!(path = %doc.path, "merging composition document");
        for (name, service) in doc.services {
            match services.entry(name) {
                Entry::Occupied(mut existing) => merge_service(existing.get_mut(), service),
                Entry::Vacant(slot) => {
                    slot.insert(service);
                }
            }
        }
        if let Some(ext) = doc.x_kube_compose {
            if ext.push_images.is_some() {
                extension.push_images = ext.push_images;
            }
            if ext.cluster_image_storage.is_some() {
                extension.cluster_image_storage = ext.cluster_image_storage;
            }
            if ext.volume_init_base_image.is_some() {
                extension.volume_init_base_image = ext.volume_init_base_image;
            }
        }
    }

    if extension.push_images.is_some() && extension.cluster_image_storage.is_some() {
        return Err(Error::Merge(
            "push_images and cluster_image_storage are mutually exclusive".to_string(),
        ));
    }
    let storage = extension
        .cluster_image_storage
        .or_else(|| {
            extension
                .push_images
                .map(|host| ClusterImageStorage::DockerRegistry { host })
        })
        .unwrap_or_default();

    let mut composition = Composition::new(storage, extension.volume_init_base_image);
    let mut dependencies: BTreeMap<String, BTreeMap<String, Readiness>> = BTreeMap::new();
    for (name, mut service) in services {
        dependencies.insert(name.clone(), std::mem::take(&mut service.depends_on));
        composition.add_service(&name, service);
    }
    composition.link_dependencies(&dependencies)?;
    Ok(composition)
}

/// Applies one later-document service on top of an earlier one.
fn merge_service(base: &mut ComposeService, over: ComposeService) {
    if over.image.is_some() {
        base.image = over.image;
    }
    if over.entrypoint.is_some() {
        base.entrypoint = over.entrypoint;
    }
    if over.working_dir.is_some() {
        base.working_dir = over.working_dir;
    }
    if over.user.is_some() {
        base.user = over.user;
    }
    base.environment.extend(over.environment);
    base.ports.extend(over.ports);
    base.volumes.extend(over.volumes);
    if over.healthcheck.is_some() {
        base.healthcheck = over.healthcheck;
    }
    for (target, readiness) in over.depends_on {
        base.depends_on
            .entry(target)
            .and_modify(|r| *r = (*r).max(readiness))
            .or_insert(readiness);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::document::parse_document;
    use crate::compose::types::HealthcheckSpec;

    fn doc(path: &str, yaml: &str) -> ComposeFile {
        parse_document(path, yaml.as_bytes()).unwrap()
    }

    #[test]
    fn test_single_document_merge_is_identity() {
        let yaml = "version: '2.4'\nservices:\n  web:\n    image: nginx:latest\n    ports: [8080]\n    environment:\n      MODE: dev\n";
        let parsed = doc("/a.yml", yaml);
        let composition = merge(vec![parsed.clone()]).unwrap();
        let service = composition.find_service_by_name("web").unwrap();
        assert_eq!(service.compose, parsed.services["web"]);
    }

    #[test]
    fn test_later_document_wins_scalars_and_env() {
        let first = doc(
            "/a.yml",
            "version: '2.4'\nservices:\n  service1:\n    image: ubuntu:latest\n    environment:\n      ENV: docker_desktop\n",
        );
        let second = doc(
            "/b.yml",
            "version: '2.4'\nservices:\n  service1:\n    environment:\n      ENV: openshift\n",
        );
        let composition = merge(vec![first, second]).unwrap();
        let service = composition.find_service_by_name("service1").unwrap();
        assert_eq!(service.compose.image.as_deref(), Some("ubuntu:latest"));
        assert_eq!(
            service.compose.environment["ENV"],
            Some("openshift".to_string())
        );
    }

    #[test]
    fn test_sequences_concatenate_with_duplicates() {
        let first = doc(
            "/a.yml",
            "version: '2'\nservices:\n  web:\n    ports: [8080, 9090]\n",
        );
        let second = doc("/b.yml", "version: '2'\nservices:\n  web:\n    ports: [8080]\n");
        let composition = merge(vec![first, second]).unwrap();
        let ports = &composition.find_service_by_name("web").unwrap().compose.ports;
        assert_eq!(ports.len(), 3);
        assert_eq!(ports[2].container, 8080);
    }

    #[test]
    fn test_healthcheck_disable_suppresses_earlier_probe() {
        let first = doc(
            "/a.yml",
            "version: '2.4'\nservices:\n  db:\n    healthcheck:\n      test: pg_isready\n",
        );
        let second = doc(
            "/b.yml",
            "version: '2.4'\nservices:\n  db:\n    healthcheck:\n      disable: true\n",
        );
        let composition = merge(vec![first, second]).unwrap();
        assert_eq!(
            composition.find_service_by_name("db").unwrap().compose.healthcheck,
            Some(HealthcheckSpec::Disabled)
        );
    }

    #[test]
    fn test_dependency_readiness_promoted() {
        let first = doc(
            "/a.yml",
            "version: '2.4'\nservices:\n  a:\n    depends_on:\n      - b\n  b:\n    healthcheck:\n      test: 'true'\n",
        );
        let second = doc(
            "/b.yml",
            "version: '2.4'\nservices:\n  a:\n    depends_on:\n      b:\n        condition: service_healthy\n",
        );
        let composition = merge(vec![first, second]).unwrap();
        let a = composition.find_service_by_name("a").unwrap();
        assert_eq!(a.depends_on.len(), 1);
        assert_eq!(a.depends_on[0].readiness, Readiness::Healthy);
    }

    #[test]
    fn test_extension_later_wins_and_legacy_maps_to_registry() {
        let first = doc(
            "/a.yml",
            "version: '2.4'\nx-kube-compose:\n  cluster_image_storage:\n    type: docker\n",
        );
        let second = doc(
            "/b.yml",
            "version: '2.4'\nx-kube-compose:\n  cluster_image_storage:\n    type: docker_registry\n    host: registry.example.com\n",
        );
        let composition = merge(vec![first, second]).unwrap();
        assert_eq!(
            composition.cluster_image_storage,
            ClusterImageStorage::DockerRegistry {
                host: "registry.example.com".to_string()
            }
        );

        let legacy = doc(
            "/c.yml",
            "version: '2'\nx-kube-compose:\n  push_images:\n    docker_registry: legacy.example.com\n",
        );
        let composition = merge(vec![legacy]).unwrap();
        assert_eq!(
            composition.cluster_image_storage,
            ClusterImageStorage::DockerRegistry {
                host: "legacy.example.com".to_string()
            }
        );
    }

    #[test]
    fn test_exclusive_extension_keys_across_documents() {
        let first = doc(
            "/a.yml",
            "version: '2'\nx-kube-compose:\n  push_images:\n    docker_registry: legacy.example.com\n",
        );
        let second = doc(
            "/b.yml",
            "version: '2.4'\nx-kube-compose:\n  cluster_image_storage:\n    type: docker\n",
        );
        assert!(matches!(merge(vec![first, second]), Err(Error::Merge(_))));
    }
}
