//! Messages of the legacy CRI schema (`runtime` package, v1alpha1).
//!
//! Only messages whose layout differs from the current schema are defined
//! here. The rest are re-exported from [`current`](super::current), so
//! `legacy::X` names every message a legacy client sends or receives.
//!
//! Upgrading maps host namespace flags to [`NamespaceMode`] and leaves
//! fields the legacy schema lacks at their defaults. Downgrading drops
//! those fields. Filesystem identifiers have no counterpart in the other
//! schema and are lost in both directions.

use std::collections::HashMap;

use super::capability::{Capabilities, ObjectList, Prefixable};
use super::current::{self, capabilities, no_capabilities, no_prefix, object_list, NamespaceMode};
use super::CriMessage;
use crate::namespace::Namespace as RuntimeNamespace;

pub use super::current::{
    AttachRequest, AttachResponse, AuthConfig, Capability, Container, ContainerAttributes,
    ContainerFilter, ContainerMetadata, ContainerState, ContainerStateValue, ContainerStatsFilter,
    ContainerStatsRequest, ContainerStatus, ContainerStatusRequest, ContainerStatusResponse,
    CpuUsage, CreateContainerResponse, Device, DnsConfig, ExecRequest, ExecResponse,
    ExecSyncRequest, ExecSyncResponse, Image, ImageFilter, ImageFsInfoRequest, ImageSpec,
    ImageStatusRequest, ImageStatusResponse, Int64Value, KeyValue, LinuxContainerResources,
    ListContainerStatsRequest, ListContainersRequest, ListContainersResponse, ListImagesRequest,
    ListImagesResponse, ListPodSandboxRequest, ListPodSandboxResponse, MemoryUsage, Mount,
    MountPropagation, NetworkConfig, PodSandbox, PodSandboxFilter, PodSandboxMetadata,
    PodSandboxNetworkStatus, PodSandboxState, PodSandboxStateValue, PodSandboxStatusRequest,
    PortForwardRequest, PortForwardResponse, PortMapping, Protocol, PullImageResponse,
    RemoveContainerRequest, RemoveContainerResponse, RemoveImageRequest, RemoveImageResponse,
    RemovePodSandboxRequest, RemovePodSandboxResponse, RunPodSandboxResponse, RuntimeCondition,
    RuntimeConfig, RuntimeStatus, SeLinuxOption, StartContainerRequest, StartContainerResponse,
    StatusRequest, StatusResponse, StopContainerRequest, StopContainerResponse,
    StopPodSandboxRequest, StopPodSandboxResponse, UInt64Value, UpdateContainerResourcesRequest,
    UpdateContainerResourcesResponse, UpdateRuntimeConfigRequest, UpdateRuntimeConfigResponse,
    VersionRequest, VersionResponse,
};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NamespaceOption {
    #[prost(bool, tag = "1")]
    pub host_network: bool,
    #[prost(bool, tag = "2")]
    pub host_pid: bool,
    #[prost(bool, tag = "3")]
    pub host_ipc: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LinuxSandboxSecurityContext {
    #[prost(message, optional, tag = "1")]
    pub namespace_options: Option<NamespaceOption>,
    #[prost(message, optional, tag = "2")]
    pub selinux_options: Option<SeLinuxOption>,
    #[prost(message, optional, tag = "3")]
    pub run_as_user: Option<Int64Value>,
    #[prost(bool, tag = "4")]
    pub readonly_rootfs: bool,
    #[prost(int64, repeated, tag = "5")]
    pub supplemental_groups: Vec<i64>,
    #[prost(bool, tag = "6")]
    pub privileged: bool,
    #[prost(string, tag = "7")]
    pub seccomp_profile_path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LinuxPodSandboxConfig {
    #[prost(string, tag = "1")]
    pub cgroup_parent: String,
    #[prost(message, optional, tag = "2")]
    pub security_context: Option<LinuxSandboxSecurityContext>,
    #[prost(map = "string, string", tag = "3")]
    pub sysctls: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PodSandboxConfig {
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<PodSandboxMetadata>,
    #[prost(string, tag = "2")]
    pub hostname: String,
    #[prost(string, tag = "3")]
    pub log_directory: String,
    #[prost(message, optional, tag = "4")]
    pub dns_config: Option<DnsConfig>,
    #[prost(message, repeated, tag = "5")]
    pub port_mappings: Vec<PortMapping>,
    #[prost(map = "string, string", tag = "6")]
    pub labels: HashMap<String, String>,
    #[prost(map = "string, string", tag = "7")]
    pub annotations: HashMap<String, String>,
    #[prost(message, optional, tag = "8")]
    pub linux: Option<LinuxPodSandboxConfig>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunPodSandboxRequest {
    #[prost(message, optional, tag = "1")]
    pub config: Option<PodSandboxConfig>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LinuxContainerSecurityContext {
    #[prost(message, optional, tag = "1")]
    pub capabilities: Option<Capability>,
    #[prost(bool, tag = "2")]
    pub privileged: bool,
    #[prost(message, optional, tag = "3")]
    pub namespace_options: Option<NamespaceOption>,
    #[prost(message, optional, tag = "4")]
    pub selinux_options: Option<SeLinuxOption>,
    #[prost(message, optional, tag = "5")]
    pub run_as_user: Option<Int64Value>,
    #[prost(string, tag = "6")]
    pub run_as_username: String,
    #[prost(bool, tag = "7")]
    pub readonly_rootfs: bool,
    #[prost(int64, repeated, tag = "8")]
    pub supplemental_groups: Vec<i64>,
    #[prost(string, tag = "9")]
    pub apparmor_profile: String,
    #[prost(string, tag = "10")]
    pub seccomp_profile_path: String,
    #[prost(bool, tag = "11")]
    pub no_new_privs: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LinuxContainerConfig {
    #[prost(message, optional, tag = "1")]
    pub resources: Option<LinuxContainerResources>,
    #[prost(message, optional, tag = "2")]
    pub security_context: Option<LinuxContainerSecurityContext>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerConfig {
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<ContainerMetadata>,
    #[prost(message, optional, tag = "2")]
    pub image: Option<ImageSpec>,
    #[prost(string, repeated, tag = "3")]
    pub command: Vec<String>,
    #[prost(string, repeated, tag = "4")]
    pub args: Vec<String>,
    #[prost(string, tag = "5")]
    pub working_dir: String,
    #[prost(message, repeated, tag = "6")]
    pub envs: Vec<KeyValue>,
    #[prost(message, repeated, tag = "7")]
    pub mounts: Vec<Mount>,
    #[prost(message, repeated, tag = "8")]
    pub devices: Vec<Device>,
    #[prost(map = "string, string", tag = "9")]
    pub labels: HashMap<String, String>,
    #[prost(map = "string, string", tag = "10")]
    pub annotations: HashMap<String, String>,
    #[prost(string, tag = "11")]
    pub log_path: String,
    #[prost(bool, tag = "12")]
    pub stdin: bool,
    #[prost(bool, tag = "13")]
    pub stdin_once: bool,
    #[prost(bool, tag = "14")]
    pub tty: bool,
    #[prost(message, optional, tag = "15")]
    pub linux: Option<LinuxContainerConfig>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateContainerRequest {
    #[prost(string, tag = "1")]
    pub pod_sandbox_id: String,
    #[prost(message, optional, tag = "2")]
    pub config: Option<ContainerConfig>,
    #[prost(message, optional, tag = "3")]
    pub sandbox_config: Option<PodSandboxConfig>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PullImageRequest {
    #[prost(message, optional, tag = "1")]
    pub image: Option<ImageSpec>,
    #[prost(message, optional, tag = "2")]
    pub auth: Option<AuthConfig>,
    #[prost(message, optional, tag = "3")]
    pub sandbox_config: Option<PodSandboxConfig>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Namespace {
    #[prost(message, optional, tag = "2")]
    pub options: Option<NamespaceOption>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LinuxPodSandboxStatus {
    #[prost(message, optional, tag = "1")]
    pub namespaces: Option<Namespace>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PodSandboxStatus {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(message, optional, tag = "2")]
    pub metadata: Option<PodSandboxMetadata>,
    #[prost(enumeration = "PodSandboxState", tag = "3")]
    pub state: i32,
    #[prost(int64, tag = "4")]
    pub created_at: i64,
    #[prost(message, optional, tag = "5")]
    pub network: Option<PodSandboxNetworkStatus>,
    #[prost(message, optional, tag = "6")]
    pub linux: Option<LinuxPodSandboxStatus>,
    #[prost(map = "string, string", tag = "7")]
    pub labels: HashMap<String, String>,
    #[prost(map = "string, string", tag = "8")]
    pub annotations: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PodSandboxStatusResponse {
    #[prost(message, optional, tag = "1")]
    pub status: Option<PodSandboxStatus>,
    #[prost(map = "string, string", tag = "2")]
    pub info: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StorageIdentifier {
    #[prost(string, tag = "1")]
    pub uuid: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FilesystemUsage {
    #[prost(int64, tag = "1")]
    pub timestamp: i64,
    #[prost(message, optional, tag = "2")]
    pub storage_id: Option<StorageIdentifier>,
    #[prost(message, optional, tag = "3")]
    pub used_bytes: Option<UInt64Value>,
    #[prost(message, optional, tag = "4")]
    pub inodes_used: Option<UInt64Value>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerStats {
    #[prost(message, optional, tag = "1")]
    pub attributes: Option<ContainerAttributes>,
    #[prost(message, optional, tag = "2")]
    pub cpu: Option<CpuUsage>,
    #[prost(message, optional, tag = "3")]
    pub memory: Option<MemoryUsage>,
    #[prost(message, optional, tag = "4")]
    pub writable_layer: Option<FilesystemUsage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerStatsResponse {
    #[prost(message, optional, tag = "1")]
    pub stats: Option<ContainerStats>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListContainerStatsResponse {
    #[prost(message, repeated, tag = "1")]
    pub stats: Vec<ContainerStats>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ImageFsInfoResponse {
    #[prost(message, repeated, tag = "1")]
    pub image_filesystems: Vec<FilesystemUsage>,
}

// ─────────────────────────────────────────────────────────────────────
// Conversion to and from the current schema
// ─────────────────────────────────────────────────────────────────────

fn mode(host: bool) -> i32 {
    if host {
        NamespaceMode::Node as i32
    } else {
        NamespaceMode::Pod as i32
    }
}

fn is_host(mode: i32) -> bool {
    mode == NamespaceMode::Node as i32
}

impl From<NamespaceOption> for current::NamespaceOption {
    fn from(o: NamespaceOption) -> Self {
        Self {
            network: mode(o.host_network),
            pid: mode(o.host_pid),
            ipc: mode(o.host_ipc),
            target_id: String::new(),
        }
    }
}

impl From<current::NamespaceOption> for NamespaceOption {
    fn from(o: current::NamespaceOption) -> Self {
        Self {
            host_network: is_host(o.network),
            host_pid: is_host(o.pid),
            host_ipc: is_host(o.ipc),
        }
    }
}

impl From<LinuxSandboxSecurityContext> for current::LinuxSandboxSecurityContext {
    fn from(c: LinuxSandboxSecurityContext) -> Self {
        Self {
            namespace_options: c.namespace_options.map(Into::into),
            selinux_options: c.selinux_options,
            run_as_user: c.run_as_user,
            readonly_rootfs: c.readonly_rootfs,
            supplemental_groups: c.supplemental_groups,
            privileged: c.privileged,
            seccomp_profile_path: c.seccomp_profile_path,
            run_as_group: None,
        }
    }
}

impl From<current::LinuxSandboxSecurityContext> for LinuxSandboxSecurityContext {
    fn from(c: current::LinuxSandboxSecurityContext) -> Self {
        Self {
            namespace_options: c.namespace_options.map(Into::into),
            selinux_options: c.selinux_options,
            run_as_user: c.run_as_user,
            readonly_rootfs: c.readonly_rootfs,
            supplemental_groups: c.supplemental_groups,
            privileged: c.privileged,
            seccomp_profile_path: c.seccomp_profile_path,
        }
    }
}

impl From<LinuxPodSandboxConfig> for current::LinuxPodSandboxConfig {
    fn from(c: LinuxPodSandboxConfig) -> Self {
        Self {
            cgroup_parent: c.cgroup_parent,
            security_context: c.security_context.map(Into::into),
            sysctls: c.sysctls,
        }
    }
}

impl From<current::LinuxPodSandboxConfig> for LinuxPodSandboxConfig {
    fn from(c: current::LinuxPodSandboxConfig) -> Self {
        Self {
            cgroup_parent: c.cgroup_parent,
            security_context: c.security_context.map(Into::into),
            sysctls: c.sysctls,
        }
    }
}

impl From<PodSandboxConfig> for current::PodSandboxConfig {
    fn from(c: PodSandboxConfig) -> Self {
        Self {
            metadata: c.metadata,
            hostname: c.hostname,
            log_directory: c.log_directory,
            dns_config: c.dns_config,
            port_mappings: c.port_mappings,
            labels: c.labels,
            annotations: c.annotations,
            linux: c.linux.map(Into::into),
        }
    }
}

impl From<current::PodSandboxConfig> for PodSandboxConfig {
    fn from(c: current::PodSandboxConfig) -> Self {
        Self {
            metadata: c.metadata,
            hostname: c.hostname,
            log_directory: c.log_directory,
            dns_config: c.dns_config,
            port_mappings: c.port_mappings,
            labels: c.labels,
            annotations: c.annotations,
            linux: c.linux.map(Into::into),
        }
    }
}

impl From<RunPodSandboxRequest> for current::RunPodSandboxRequest {
    fn from(r: RunPodSandboxRequest) -> Self {
        Self {
            config: r.config.map(Into::into),
            runtime_handler: String::new(),
        }
    }
}

impl From<current::RunPodSandboxRequest> for RunPodSandboxRequest {
    fn from(r: current::RunPodSandboxRequest) -> Self {
        Self {
            config: r.config.map(Into::into),
        }
    }
}

impl From<LinuxContainerSecurityContext> for current::LinuxContainerSecurityContext {
    fn from(c: LinuxContainerSecurityContext) -> Self {
        Self {
            capabilities: c.capabilities,
            privileged: c.privileged,
            namespace_options: c.namespace_options.map(Into::into),
            selinux_options: c.selinux_options,
            run_as_user: c.run_as_user,
            run_as_username: c.run_as_username,
            readonly_rootfs: c.readonly_rootfs,
            supplemental_groups: c.supplemental_groups,
            apparmor_profile: c.apparmor_profile,
            seccomp_profile_path: c.seccomp_profile_path,
            no_new_privs: c.no_new_privs,
            run_as_group: None,
            masked_paths: Vec::new(),
            readonly_paths: Vec::new(),
        }
    }
}

impl From<current::LinuxContainerSecurityContext> for LinuxContainerSecurityContext {
    fn from(c: current::LinuxContainerSecurityContext) -> Self {
        Self {
            capabilities: c.capabilities,
            privileged: c.privileged,
            namespace_options: c.namespace_options.map(Into::into),
            selinux_options: c.selinux_options,
            run_as_user: c.run_as_user,
            run_as_username: c.run_as_username,
            readonly_rootfs: c.readonly_rootfs,
            supplemental_groups: c.supplemental_groups,
            apparmor_profile: c.apparmor_profile,
            seccomp_profile_path: c.seccomp_profile_path,
            no_new_privs: c.no_new_privs,
        }
    }
}

impl From<LinuxContainerConfig> for current::LinuxContainerConfig {
    fn from(c: LinuxContainerConfig) -> Self {
        Self {
            resources: c.resources,
            security_context: c.security_context.map(Into::into),
        }
    }
}

impl From<current::LinuxContainerConfig> for LinuxContainerConfig {
    fn from(c: current::LinuxContainerConfig) -> Self {
        Self {
            resources: c.resources,
            security_context: c.security_context.map(Into::into),
        }
    }
}

impl From<ContainerConfig> for current::ContainerConfig {
    fn from(c: ContainerConfig) -> Self {
        Self {
            metadata: c.metadata,
            image: c.image,
            command: c.command,
            args: c.args,
            working_dir: c.working_dir,
            envs: c.envs,
            mounts: c.mounts,
            devices: c.devices,
            labels: c.labels,
            annotations: c.annotations,
            log_path: c.log_path,
            stdin: c.stdin,
            stdin_once: c.stdin_once,
            tty: c.tty,
            linux: c.linux.map(Into::into),
        }
    }
}

impl From<current::ContainerConfig> for ContainerConfig {
    fn from(c: current::ContainerConfig) -> Self {
        Self {
            metadata: c.metadata,
            image: c.image,
            command: c.command,
            args: c.args,
            working_dir: c.working_dir,
            envs: c.envs,
            mounts: c.mounts,
            devices: c.devices,
            labels: c.labels,
            annotations: c.annotations,
            log_path: c.log_path,
            stdin: c.stdin,
            stdin_once: c.stdin_once,
            tty: c.tty,
            linux: c.linux.map(Into::into),
        }
    }
}

impl From<CreateContainerRequest> for current::CreateContainerRequest {
    fn from(r: CreateContainerRequest) -> Self {
        Self {
            pod_sandbox_id: r.pod_sandbox_id,
            config: r.config.map(Into::into),
            sandbox_config: r.sandbox_config.map(Into::into),
        }
    }
}

impl From<current::CreateContainerRequest> for CreateContainerRequest {
    fn from(r: current::CreateContainerRequest) -> Self {
        Self {
            pod_sandbox_id: r.pod_sandbox_id,
            config: r.config.map(Into::into),
            sandbox_config: r.sandbox_config.map(Into::into),
        }
    }
}

impl From<PullImageRequest> for current::PullImageRequest {
    fn from(r: PullImageRequest) -> Self {
        Self {
            image: r.image,
            auth: r.auth,
            sandbox_config: r.sandbox_config.map(Into::into),
        }
    }
}

impl From<current::PullImageRequest> for PullImageRequest {
    fn from(r: current::PullImageRequest) -> Self {
        Self {
            image: r.image,
            auth: r.auth,
            sandbox_config: r.sandbox_config.map(Into::into),
        }
    }
}

impl From<Namespace> for current::Namespace {
    fn from(n: Namespace) -> Self {
        Self {
            options: n.options.map(Into::into),
        }
    }
}

impl From<current::Namespace> for Namespace {
    fn from(n: current::Namespace) -> Self {
        Self {
            options: n.options.map(Into::into),
        }
    }
}

impl From<LinuxPodSandboxStatus> for current::LinuxPodSandboxStatus {
    fn from(s: LinuxPodSandboxStatus) -> Self {
        Self {
            namespaces: s.namespaces.map(Into::into),
        }
    }
}

impl From<current::LinuxPodSandboxStatus> for LinuxPodSandboxStatus {
    fn from(s: current::LinuxPodSandboxStatus) -> Self {
        Self {
            namespaces: s.namespaces.map(Into::into),
        }
    }
}

impl From<PodSandboxStatus> for current::PodSandboxStatus {
    fn from(s: PodSandboxStatus) -> Self {
        Self {
            id: s.id,
            metadata: s.metadata,
            state: s.state,
            created_at: s.created_at,
            network: s.network,
            linux: s.linux.map(Into::into),
            labels: s.labels,
            annotations: s.annotations,
            runtime_handler: String::new(),
        }
    }
}

impl From<current::PodSandboxStatus> for PodSandboxStatus {
    fn from(s: current::PodSandboxStatus) -> Self {
        Self {
            id: s.id,
            metadata: s.metadata,
            state: s.state,
            created_at: s.created_at,
            network: s.network,
            linux: s.linux.map(Into::into),
            labels: s.labels,
            annotations: s.annotations,
        }
    }
}

impl From<PodSandboxStatusResponse> for current::PodSandboxStatusResponse {
    fn from(r: PodSandboxStatusResponse) -> Self {
        Self {
            status: r.status.map(Into::into),
            info: r.info,
        }
    }
}

impl From<current::PodSandboxStatusResponse> for PodSandboxStatusResponse {
    fn from(r: current::PodSandboxStatusResponse) -> Self {
        Self {
            status: r.status.map(Into::into),
            info: r.info,
        }
    }
}

impl From<FilesystemUsage> for current::FilesystemUsage {
    fn from(u: FilesystemUsage) -> Self {
        Self {
            timestamp: u.timestamp,
            fs_id: None,
            used_bytes: u.used_bytes,
            inodes_used: u.inodes_used,
        }
    }
}

impl From<current::FilesystemUsage> for FilesystemUsage {
    fn from(u: current::FilesystemUsage) -> Self {
        Self {
            timestamp: u.timestamp,
            storage_id: None,
            used_bytes: u.used_bytes,
            inodes_used: u.inodes_used,
        }
    }
}

impl From<ContainerStats> for current::ContainerStats {
    fn from(s: ContainerStats) -> Self {
        Self {
            attributes: s.attributes,
            cpu: s.cpu,
            memory: s.memory,
            writable_layer: s.writable_layer.map(Into::into),
        }
    }
}

impl From<current::ContainerStats> for ContainerStats {
    fn from(s: current::ContainerStats) -> Self {
        Self {
            attributes: s.attributes,
            cpu: s.cpu,
            memory: s.memory,
            writable_layer: s.writable_layer.map(Into::into),
        }
    }
}

impl From<ContainerStatsResponse> for current::ContainerStatsResponse {
    fn from(r: ContainerStatsResponse) -> Self {
        Self {
            stats: r.stats.map(Into::into),
        }
    }
}

impl From<current::ContainerStatsResponse> for ContainerStatsResponse {
    fn from(r: current::ContainerStatsResponse) -> Self {
        Self {
            stats: r.stats.map(Into::into),
        }
    }
}

impl From<ListContainerStatsResponse> for current::ListContainerStatsResponse {
    fn from(r: ListContainerStatsResponse) -> Self {
        Self {
            stats: r.stats.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<current::ListContainerStatsResponse> for ListContainerStatsResponse {
    fn from(r: current::ListContainerStatsResponse) -> Self {
        Self {
            stats: r.stats.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<ImageFsInfoResponse> for current::ImageFsInfoResponse {
    fn from(r: ImageFsInfoResponse) -> Self {
        Self {
            image_filesystems: r.image_filesystems.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<current::ImageFsInfoResponse> for ImageFsInfoResponse {
    fn from(r: current::ImageFsInfoResponse) -> Self {
        Self {
            image_filesystems: r.image_filesystems.into_iter().map(Into::into).collect(),
        }
    }
}

/// Implements [`CriMessage`] through the `From` conversions above.
macro_rules! legacy_schema {
    ($($ty:ident),+ $(,)?) => {
        $(
            impl CriMessage for $ty {
                type Upgraded = current::$ty;

                fn upgrade(self) -> current::$ty {
                    self.into()
                }

                fn downgrade(upgraded: current::$ty) -> Self {
                    upgraded.into()
                }
            }
        )+
    };
}

legacy_schema!(
    RunPodSandboxRequest,
    CreateContainerRequest,
    PullImageRequest,
    PodSandboxStatusResponse,
    ContainerStatsResponse,
    ListContainerStatsResponse,
    ImageFsInfoResponse,
);

// ─────────────────────────────────────────────────────────────────────
// Routing views
// ─────────────────────────────────────────────────────────────────────

no_capabilities!(
    PodSandboxStatusResponse,
    ContainerStatsResponse,
    ListContainerStatsResponse,
    ImageFsInfoResponse,
);

no_prefix!(
    RunPodSandboxRequest,
    CreateContainerRequest,
    PullImageRequest,
    ListContainerStatsResponse,
    ImageFsInfoResponse,
    FilesystemUsage,
);

capabilities!(CreateContainerRequest {
    pod_sandbox_id(m) => Some(&mut m.pod_sandbox_id);
    image(m) => m.config.as_mut().and_then(|c| c.image.as_mut()).map(|i| &mut i.image);
});

capabilities!(PullImageRequest {
    image(m) => m.image.as_mut().map(|i| &mut i.image);
});

impl Capabilities for RunPodSandboxRequest {
    fn annotations(&self) -> Option<&HashMap<String, String>> {
        self.config.as_ref().map(|c| &c.annotations)
    }
}

object_list!(
    ListContainerStatsResponse => stats: ContainerStats,
    ImageFsInfoResponse => image_filesystems: FilesystemUsage,
);

impl Prefixable for ContainerStats {
    fn add_prefix(&mut self, namespace: &RuntimeNamespace) {
        if let Some(attributes) = self.attributes.as_mut() {
            attributes.id = namespace.augment_id(&attributes.id);
        }
    }
}

impl Prefixable for ContainerStatsResponse {
    fn add_prefix(&mut self, namespace: &RuntimeNamespace) {
        if let Some(stats) = self.stats.as_mut() {
            stats.add_prefix(namespace);
        }
    }
}

impl Prefixable for PodSandboxStatusResponse {
    fn add_prefix(&mut self, namespace: &RuntimeNamespace) {
        if let Some(status) = self.status.as_mut() {
            status.id = namespace.augment_id(&status.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox_config(host_network: bool) -> PodSandboxConfig {
        let mut annotations = HashMap::new();
        annotations.insert("kubernetes.io/target-runtime".to_string(), "alt".to_string());
        PodSandboxConfig {
            metadata: Some(PodSandboxMetadata {
                name: "nginx".to_string(),
                uid: "uid-1".to_string(),
                namespace: "default".to_string(),
                attempt: 2,
            }),
            hostname: "nginx".to_string(),
            annotations,
            linux: Some(LinuxPodSandboxConfig {
                cgroup_parent: "/kubepods".to_string(),
                security_context: Some(LinuxSandboxSecurityContext {
                    namespace_options: Some(NamespaceOption {
                        host_network,
                        host_pid: false,
                        host_ipc: true,
                    }),
                    run_as_user: Some(Int64Value { value: 1000 }),
                    supplemental_groups: vec![1, 2],
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn namespace_options(config: &current::PodSandboxConfig) -> current::NamespaceOption {
        config
            .linux
            .as_ref()
            .and_then(|l| l.security_context.as_ref())
            .and_then(|s| s.namespace_options.clone())
            .unwrap_or_default()
    }

    #[test]
    fn test_host_flags_map_to_namespace_modes() {
        let request = RunPodSandboxRequest {
            config: Some(sandbox_config(true)),
        };
        let upgraded = request.upgrade();
        let options = namespace_options(upgraded.config.as_ref().unwrap());
        assert_eq!(options.network(), NamespaceMode::Node);
        assert_eq!(options.pid(), NamespaceMode::Pod);
        assert_eq!(options.ipc(), NamespaceMode::Node);
        assert!(upgraded.runtime_handler.is_empty());
    }

    #[test]
    fn test_round_trip_preserves_legacy_fields() {
        for host_network in [true, false] {
            let request = RunPodSandboxRequest {
                config: Some(sandbox_config(host_network)),
            };
            let back = RunPodSandboxRequest::downgrade(request.clone().upgrade());
            assert_eq!(back, request);
        }

        let create = CreateContainerRequest {
            pod_sandbox_id: "p1".to_string(),
            config: Some(ContainerConfig {
                image: Some(ImageSpec { image: "nginx".to_string() }),
                command: vec!["/bin/sh".to_string()],
                linux: Some(LinuxContainerConfig {
                    security_context: Some(LinuxContainerSecurityContext {
                        privileged: true,
                        apparmor_profile: "runtime/default".to_string(),
                        namespace_options: Some(NamespaceOption {
                            host_pid: true,
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            sandbox_config: Some(sandbox_config(false)),
        };
        assert_eq!(CreateContainerRequest::downgrade(create.clone().upgrade()), create);
    }

    #[test]
    fn test_upgrade_is_idempotent() {
        let request = RunPodSandboxRequest {
            config: Some(sandbox_config(true)),
        };
        let once = request.upgrade();
        let twice = CriMessage::upgrade(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_downgrade_drops_newer_fields() {
        let current = current::LinuxContainerSecurityContext {
            namespace_options: Some(current::NamespaceOption {
                network: NamespaceMode::Container as i32,
                pid: NamespaceMode::Target as i32,
                ipc: NamespaceMode::Node as i32,
                target_id: "c1".to_string(),
            }),
            run_as_group: Some(Int64Value { value: 5 }),
            masked_paths: vec!["/proc/kcore".to_string()],
            ..Default::default()
        };
        let legacy = LinuxContainerSecurityContext::from(current);
        assert_eq!(
            legacy.namespace_options,
            Some(NamespaceOption {
                host_network: false,
                host_pid: false,
                host_ipc: true,
            })
        );
    }

    #[test]
    fn test_filesystem_identifiers_are_lost() {
        let response = ImageFsInfoResponse {
            image_filesystems: vec![FilesystemUsage {
                timestamp: 42,
                storage_id: Some(StorageIdentifier { uuid: "u-1".to_string() }),
                used_bytes: Some(UInt64Value { value: 1024 }),
                inodes_used: Some(UInt64Value { value: 7 }),
            }],
        };
        let upgraded = response.upgrade();
        assert_eq!(upgraded.image_filesystems[0].fs_id, None);
        assert_eq!(upgraded.image_filesystems[0].used_bytes, Some(UInt64Value { value: 1024 }));

        let back = ImageFsInfoResponse::downgrade(upgraded);
        assert_eq!(back.image_filesystems[0].storage_id, None);
        assert_eq!(back.image_filesystems[0].timestamp, 42);
    }

    #[test]
    fn test_legacy_stats_prefix() {
        let namespace = RuntimeNamespace::named("alt").unwrap();
        let mut response = ContainerStatsResponse {
            stats: Some(ContainerStats {
                attributes: Some(ContainerAttributes {
                    id: "c1".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        };
        response.add_prefix(&namespace);
        assert_eq!(response.stats.unwrap().attributes.unwrap().id, "alt__c1");
    }
}
