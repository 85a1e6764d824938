//! Deterministic volume naming and mount specs.
//!
//! A volume name encodes everything that makes it unique: the run, the
//! instance and the in-container path. The path part is reversed before
//! truncation so that paths sharing a long prefix still differ in the part
//! that survives the cut.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use dynsched_id::{InstanceId, ProjectId, RunId, UserId};
use dynsched_swarm::models::{DriverConfig, Labels, Mount, MountKind, VolumeOptions};

use crate::models::labels;

/// Every volume is mounted below this directory inside the sidecar.
pub const BASE_PATH: &str = "/dy-volumes";

pub const VOLUME_NAME_PREFIX: &str = "dyv";

/// Upper bound for a docker volume name.
pub const MAX_VOLUME_NAME_LENGTH: usize = 255;

/// In-container path shared between the sidecar and the user services.
pub const SHARED_STORE_PATH: &str = "/shared-store";

/// Remote storage settings for state volumes mounted through rclone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStorage {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

pub struct VolumePathsResolver;

impl VolumePathsResolver {
    /// Mount target below [`BASE_PATH`], re-rooting absolute paths.
    pub fn target(path: &Path) -> String {
        let relative: PathBuf = path
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        Path::new(BASE_PATH).join(relative).to_string_lossy().into_owned()
    }

    /// Path with separators replaced, e.g. `/a/b` -> `_a_b`.
    pub fn volume_name(path: &Path) -> String {
        path.to_string_lossy().replace('/', "_")
    }

    /// Cluster-wide volume name for one (run, instance, path) tuple.
    pub fn source(path: &Path, instance_id: InstanceId, run_id: RunId) -> String {
        let reversed: String = Self::volume_name(path).chars().rev().collect();
        let mut name = format!("{VOLUME_NAME_PREFIX}_{run_id}_{instance_id}_{reversed}");
        // every component is ASCII except possibly the path; cut on a char boundary
        if name.len() > MAX_VOLUME_NAME_LENGTH {
            let cut = (0..=MAX_VOLUME_NAME_LENGTH)
                .rev()
                .find(|i| name.is_char_boundary(*i))
                .unwrap_or(0);
            name.truncate(cut);
        }
        name
    }

    fn volume_labels(
        source: &str,
        swarm_stack_name: &str,
        instance_id: InstanceId,
        run_id: RunId,
        project_id: ProjectId,
        user_id: UserId,
    ) -> Labels {
        BTreeMap::from([
            ("source".to_string(), source.to_string()),
            (labels::RUN_ID.to_string(), run_id.to_string()),
            ("node_uuid".to_string(), instance_id.to_string()),
            (labels::STUDY_ID.to_string(), project_id.to_string()),
            (labels::USER_ID.to_string(), user_id.to_string()),
            (labels::SWARM_STACK_NAME.to_string(), swarm_stack_name.to_string()),
        ])
    }

    /// Local volume mount for one path of the user service.
    pub fn mount_entry(
        swarm_stack_name: &str,
        path: &Path,
        instance_id: InstanceId,
        run_id: RunId,
        project_id: ProjectId,
        user_id: UserId,
    ) -> Mount {
        let source = Self::source(path, instance_id, run_id);
        Mount {
            target: Self::target(path),
            kind: MountKind::Volume,
            read_only: None,
            volume_options: Some(VolumeOptions {
                labels: Self::volume_labels(
                    &source,
                    swarm_stack_name,
                    instance_id,
                    run_id,
                    project_id,
                    user_id,
                ),
                driver_config: None,
            }),
            source: Some(source),
        }
    }

    /// Volume for the store the sidecar shares with the user services.
    pub fn mount_shared_store(
        swarm_stack_name: &str,
        instance_id: InstanceId,
        run_id: RunId,
        project_id: ProjectId,
        user_id: UserId,
    ) -> Mount {
        Self::mount_entry(
            swarm_stack_name,
            Path::new(SHARED_STORE_PATH),
            instance_id,
            run_id,
            project_id,
            user_id,
        )
    }

    /// State volume served from remote storage by the rclone volume plugin.
    pub fn mount_remote_storage(
        swarm_stack_name: &str,
        path: &Path,
        instance_id: InstanceId,
        run_id: RunId,
        project_id: ProjectId,
        user_id: UserId,
        storage: &RemoteStorage,
    ) -> Mount {
        let mut mount = Self::mount_entry(
            swarm_stack_name,
            path,
            instance_id,
            run_id,
            project_id,
            user_id,
        );
        let remote_path = format!(
            "{}/{}/{}/{}",
            storage.bucket,
            project_id,
            instance_id,
            Self::volume_name(path).trim_start_matches('_')
        );
        let options = BTreeMap::from([
            ("type".to_string(), "s3".to_string()),
            ("s3-provider".to_string(), "Minio".to_string()),
            ("s3-endpoint".to_string(), storage.endpoint.clone()),
            ("s3-access_key_id".to_string(), storage.access_key.clone()),
            ("s3-secret_access_key".to_string(), storage.secret_key.clone()),
            ("path".to_string(), remote_path),
            ("allow-other".to_string(), "true".to_string()),
            ("vfs-cache-mode".to_string(), "minimal".to_string()),
        ]);
        if let Some(volume_options) = mount.volume_options.as_mut() {
            volume_options.driver_config = Some(DriverConfig {
                name: "rclone".to_string(),
                options,
            });
        }
        mount
    }

    /// Names of every volume an instance's sidecar creates on its node.
    pub fn all_sources(paths: &[PathBuf], instance_id: InstanceId, run_id: RunId) -> Vec<String> {
        let mut sources: Vec<String> = std::iter::once(Path::new(SHARED_STORE_PATH))
            .chain(paths.iter().map(PathBuf::as_path))
            .map(|p| Self::source(p, instance_id, run_id))
            .collect();
        sources.sort();
        sources.dedup();
        sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_target_is_rerooted() {
        assert_eq!(
            VolumePathsResolver::target(Path::new("/home/user/work/inputs")),
            "/dy-volumes/home/user/work/inputs"
        );
        assert_eq!(VolumePathsResolver::target(Path::new("relative/dir")), "/dy-volumes/relative/dir");
    }

    #[test]
    fn test_source_layout() {
        let instance_id: InstanceId = "2b4d6c4e-5a8f-4d1c-9a55-0c3f1e7d2b10".parse().unwrap();
        let run_id: RunId = "run_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse().unwrap();
        let source = VolumePathsResolver::source(Path::new("/work/outputs"), instance_id, run_id);
        assert_eq!(
            source,
            "dyv_run_01HV4Z2WQXKJNM8GPQY6VBKC3D_2b4d6c4e-5a8f-4d1c-9a55-0c3f1e7d2b10_stuptuo_krow_"
        );
    }

    #[test]
    fn test_long_shared_prefix_paths_do_not_collide() {
        let instance_id = InstanceId::new();
        let run_id = RunId::new();
        let prefix = "/a".repeat(150);
        let corpus: Vec<PathBuf> = ["x", "y", "inputs", "outputs", "workspace", "workspace2"]
            .iter()
            .map(|leaf| PathBuf::from(format!("{prefix}/{leaf}")))
            .collect();

        let names: HashSet<String> = corpus
            .iter()
            .map(|p| VolumePathsResolver::source(p, instance_id, run_id))
            .collect();

        assert_eq!(names.len(), corpus.len());
        assert!(names.iter().all(|n| n.len() <= MAX_VOLUME_NAME_LENGTH));
    }

    #[test]
    fn test_mount_entry_labels() {
        let instance_id = InstanceId::new();
        let run_id = RunId::new();
        let mount = VolumePathsResolver::mount_entry(
            "stack",
            Path::new("/work/inputs"),
            instance_id,
            run_id,
            ProjectId::new(),
            UserId::new(3),
        );
        let labels = &mount.volume_options.as_ref().unwrap().labels;
        assert_eq!(labels["swarm_stack_name"], "stack");
        assert_eq!(labels["run_id"], run_id.to_string());
        assert_eq!(labels["source"], *mount.source.as_ref().unwrap());
        assert_eq!(mount.target, "/dy-volumes/work/inputs");
    }

    #[test]
    fn test_remote_storage_mount_uses_rclone() {
        let storage = RemoteStorage {
            endpoint: "http://s3:9000".into(),
            bucket: "simcore".into(),
            access_key: "a".into(),
            secret_key: "s".into(),
        };
        let mount = VolumePathsResolver::mount_remote_storage(
            "stack",
            Path::new("/work/workspace"),
            InstanceId::new(),
            RunId::new(),
            ProjectId::new(),
            UserId::new(3),
            &storage,
        );
        let driver = mount.volume_options.unwrap().driver_config.unwrap();
        assert_eq!(driver.name, "rclone");
        assert!(driver.options["path"].ends_with("work_workspace"));
    }

    #[test]
    fn test_all_sources_include_shared_store() {
        let instance_id = InstanceId::new();
        let run_id = RunId::new();
        let sources = VolumePathsResolver::all_sources(
            &[PathBuf::from("/in"), PathBuf::from("/out"), PathBuf::from("/in")],
            instance_id,
            run_id,
        );
        assert_eq!(sources.len(), 3);
        assert!(sources.contains(&VolumePathsResolver::source(
            Path::new(SHARED_STORE_PATH),
            instance_id,
            run_id
        )));
    }

    proptest! {
        #[test]
        fn prop_source_is_deterministic(path in "(/[a-z0-9_]{1,12}){1,20}") {
            let instance_id = InstanceId::from_uuid(uuid::Uuid::from_u128(7));
            let run_id = RunId::from_ulid(dynsched_id::Ulid(11));
            let a = VolumePathsResolver::source(Path::new(&path), instance_id, run_id);
            let b = VolumePathsResolver::source(Path::new(&path), instance_id, run_id);
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_source_differs_when_inputs_differ(
            path in "(/[a-z]{1,8}){1,6}",
            leaf_a in "[a-z]{1,6}",
            leaf_b in "[a-z]{1,6}",
        ) {
            prop_assume!(leaf_a != leaf_b);
            let instance_id = InstanceId::new();
            let run_id = RunId::new();
            let a = VolumePathsResolver::source(Path::new(&format!("{path}/{leaf_a}")), instance_id, run_id);
            let b = VolumePathsResolver::source(Path::new(&format!("{path}/{leaf_b}")), instance_id, run_id);
            prop_assert_ne!(&a, &b);

            let other_run = VolumePathsResolver::source(Path::new(&format!("{path}/{leaf_a}")), instance_id, RunId::new());
            prop_assert_ne!(&a, &other_run);
            let other_instance = VolumePathsResolver::source(Path::new(&format!("{path}/{leaf_a}")), InstanceId::new(), run_id);
            prop_assert_ne!(&a, &other_instance);
        }
    }
}
