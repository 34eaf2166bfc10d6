/*
Copyright 2024 The lxe Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Two-way mapping between the CRI request shapes and the manager's flat
//! key/value configuration and device list.
//!
//! The `user.linux.*` key table here is a stable contract: decoding reads
//! exactly what encoding wrote, also across process restarts and version
//! upgrades. Extensions add new keys, they never reuse existing ones.

use std::collections::HashMap;

use time::OffsetDateTime;

use crate::api;
use crate::backend::{
    Container, ContainerResources, ContainerStateName, Device, Disk, NetworkConfig, NetworkMode,
    Protocol, Proxy, ProxyEndpoint, Sandbox, SandboxState, CFG_CGROUP_PARENT,
    CFG_NAMESPACE_OPTIONS, CFG_NETWORK_CONFIG, CFG_SECURITY_PRIVILEGED, CFG_SYSCTLS_PREFIX,
};

/// Set `key` only when `value` is non-empty.
pub fn set_if_set(config: &mut HashMap<String, String>, key: &str, value: &str) {
    if !value.is_empty() {
        config.insert(key.to_string(), value.to_string());
    }
}

/// Append a line to a newline-separated config value, so repeated writers
/// compose instead of clobbering each other.
pub fn append_if_set(config: &mut HashMap<String, String>, key: &str, line: &str) {
    if line.is_empty() {
        return;
    }
    match config.get_mut(key) {
        Some(existing) if !existing.is_empty() => {
            existing.push('\n');
            existing.push_str(line);
        }
        _ => {
            config.insert(key.to_string(), line.to_string());
        }
    }
}

/// Lowercased symbolic name of a CRI namespace mode, the form stored in the
/// flat configuration.
pub fn namespace_mode_name(mode: i32) -> String {
    api::NamespaceMode::try_from(mode)
        .unwrap_or(api::NamespaceMode::Pod)
        .as_str_name()
        .to_lowercase()
}

/// Inverse of [`namespace_mode_name`]; unknown names land on POD, the proto
/// zero value.
pub fn namespace_mode_from_name(name: &str) -> i32 {
    api::NamespaceMode::from_str_name(&name.to_uppercase())
        .map(|m| m as i32)
        .unwrap_or(0)
}

pub fn state_sandbox_as_cri(state: SandboxState) -> i32 {
    let name = format!("SANDBOX_{}", state.as_str().to_uppercase());
    api::PodSandboxState::from_str_name(&name)
        .unwrap_or(api::PodSandboxState::SandboxNotready) as i32
}

pub fn state_container_as_cri(state: ContainerStateName) -> i32 {
    let name = format!("CONTAINER_{}", state.as_str().to_uppercase());
    api::ContainerState::from_str_name(&name).unwrap_or(api::ContainerState::ContainerUnknown)
        as i32
}

/// Subset containment check used by every label selector: the base map must
/// carry every filter entry with the identical value. An empty filter
/// matches everything.
pub fn compare_filter_map(base: &HashMap<String, String>, filter: &HashMap<String, String>) -> bool {
    filter
        .iter()
        .all(|(k, v)| base.get(k).map(|b| b == v).unwrap_or(false))
}

/// Rewrite a mount target away from `/var/run` and `/run`. Most distributions
/// symlink the former to the latter and tmpfs-mount the latter, either of
/// which hides manager-injected mounts from the payload.
pub fn rewrite_container_path(container_path: &str) -> String {
    let mut path = container_path.to_string();
    if let Some(suffix) = path.strip_prefix("/var/run") {
        path = format!("/run{}", suffix);
    }
    if let Some(suffix) = path.strip_prefix("/run") {
        path = format!("/mnt{}", suffix);
    }
    path
}

/// Unix nanoseconds of an optional timestamp; zero when absent, the CRI
/// convention for "not specified".
pub fn ts_nanos(ts: Option<OffsetDateTime>) -> i64 {
    ts.map(|t| t.unix_timestamp_nanos() as i64).unwrap_or(0)
}

/// Encode the Linux sandbox configuration into the flat config map and the
/// device list.
pub fn encode_linux_config(sb: &mut Sandbox, linux: &api::LinuxPodSandboxConfig) {
    set_if_set(&mut sb.config, CFG_CGROUP_PARENT, &linux.cgroup_parent);

    for (key, value) in &linux.sysctls {
        sb.config
            .insert(format!("{}{}", CFG_SYSCTLS_PREFIX, key), value.clone());
    }

    let sc = match &linux.security_context {
        Some(sc) => sc,
        None => return,
    };

    // The Kubernetes-layer truth and the manager-native enforced switch.
    sb.config.insert(
        format!("{}.privileged", crate::backend::CFG_PREFIX_SECURITY_CONTEXT),
        sc.privileged.to_string(),
    );
    sb.config
        .insert(CFG_SECURITY_PRIVILEGED.to_string(), sc.privileged.to_string());

    if let Some(nso) = &sc.namespace_options {
        sb.config.insert(
            format!("{}.ipc", CFG_NAMESPACE_OPTIONS),
            namespace_mode_name(nso.ipc),
        );
        sb.config.insert(
            format!("{}.network", CFG_NAMESPACE_OPTIONS),
            namespace_mode_name(nso.network),
        );
        sb.config.insert(
            format!("{}.pid", CFG_NAMESPACE_OPTIONS),
            namespace_mode_name(nso.pid),
        );
    }

    if sc.readonly_rootfs {
        sb.devices.upsert(Device::Disk(Disk {
            path: "/".to_string(),
            readonly: true,
            pool: "default".to_string(),
            ..Default::default()
        }));
    }

    if let Some(run_as_user) = &sc.run_as_user {
        sb.config.insert(
            format!("{}.run_as_user", crate::backend::CFG_PREFIX_SECURITY_CONTEXT),
            run_as_user.value.to_string(),
        );
    }

    set_if_set(
        &mut sb.config,
        &format!(
            "{}.seccomp_profile_path",
            crate::backend::CFG_PREFIX_SECURITY_CONTEXT
        ),
        &sc.seccomp_profile_path,
    );

    // The SELinux fields share the namespace_options key prefix. Historical,
    // but part of the persisted contract, so it stays.
    if let Some(so) = &sc.selinux_options {
        set_if_set(&mut sb.config, &format!("{}.role", CFG_NAMESPACE_OPTIONS), &so.role);
        set_if_set(&mut sb.config, &format!("{}.level", CFG_NAMESPACE_OPTIONS), &so.level);
        set_if_set(&mut sb.config, &format!("{}.user", CFG_NAMESPACE_OPTIONS), &so.user);
        set_if_set(&mut sb.config, &format!("{}.type", CFG_NAMESPACE_OPTIONS), &so.r#type);
    }
}

/// Rebuild the namespace options of a sandbox status from the flat config.
/// Returns nothing when no namespace key was ever written.
pub fn decode_namespace_options(config: &HashMap<String, String>) -> Option<api::Namespace> {
    let prefix = format!("{}.", CFG_NAMESPACE_OPTIONS);
    let mut options: Option<api::NamespaceOption> = None;

    for (k, v) in config {
        let key = match k.strip_prefix(&prefix) {
            Some(key) => key,
            None => continue,
        };
        match key {
            "ipc" => {
                options.get_or_insert_with(Default::default).ipc = namespace_mode_from_name(v)
            }
            "pid" => {
                options.get_or_insert_with(Default::default).pid = namespace_mode_from_name(v)
            }
            "network" => {
                options.get_or_insert_with(Default::default).network = namespace_mode_from_name(v)
            }
            // SELinux keys live under the same prefix and are not namespace
            // modes.
            _ => {}
        }
    }

    options.map(|options| api::Namespace {
        options: Some(options),
    })
}

/// Persist the sandbox network record into the flat configuration. The mode
/// and mode-data survive a process restart only here; the in-memory record
/// is the decoded view.
pub fn encode_network_config(sb: &mut Sandbox) {
    let network = &sb.network;
    sb.config.insert(
        format!("{}.mode", CFG_NETWORK_CONFIG),
        network.mode.as_str().to_string(),
    );
    sb.config.insert(
        format!("{}.mode_data", CFG_NETWORK_CONFIG),
        network.mode_data.clone(),
    );
    sb.config.insert(
        format!("{}.nameservers", CFG_NETWORK_CONFIG),
        network.nameservers.join(","),
    );
    sb.config.insert(
        format!("{}.searches", CFG_NETWORK_CONFIG),
        network.searches.join(","),
    );
}

/// Rebuild the network record from the flat configuration. Missing keys
/// yield the defaults, so sandboxes predating a key read cleanly.
pub fn decode_network_config(config: &HashMap<String, String>) -> NetworkConfig {
    let get = |name: &str| config.get(&format!("{}.{}", CFG_NETWORK_CONFIG, name));
    NetworkConfig {
        mode: get("mode").map(|m| NetworkMode::parse(m)).unwrap_or_default(),
        mode_data: get("mode_data").cloned().unwrap_or_default(),
        nameservers: split_list(get("nameservers")),
        searches: split_list(get("searches")),
    }
}

fn split_list(value: Option<&String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Translate port mappings into proxy devices on the sandbox. Mappings with a
/// zero port on either side are dropped; unknown protocols forward as TCP.
pub fn apply_port_mappings(sb: &mut Sandbox, mappings: &[api::PortMapping]) {
    for mapping in mappings {
        if mapping.host_port == 0 || mapping.container_port == 0 {
            continue;
        }

        let protocol = match api::Protocol::try_from(mapping.protocol) {
            Ok(api::Protocol::Udp) => Protocol::Udp,
            _ => Protocol::Tcp,
        };

        let host_ip = if mapping.host_ip.is_empty() {
            "0.0.0.0".to_string()
        } else {
            mapping.host_ip.clone()
        };

        sb.devices.upsert(Device::Proxy(Proxy {
            listen: ProxyEndpoint {
                protocol,
                address: host_ip,
                port: mapping.host_port,
            },
            destination: ProxyEndpoint {
                protocol,
                address: "127.0.0.1".to_string(),
                port: mapping.container_port,
            },
        }));
    }
}

/// Move the three reserved cloud-init keys out of the environment; everything
/// else stays an environment variable.
pub fn apply_environment(c: &mut Container, envs: &[api::KeyValue]) {
    for env in envs {
        match env.key.as_str() {
            "user-data" => c.cloud_init_user_data = env.value.clone(),
            "meta-data" => c.cloud_init_meta_data = env.value.clone(),
            "network-config" => c.cloud_init_network_config = env.value.clone(),
            _ => {
                c.environment.insert(env.key.clone(), env.value.clone());
            }
        }
    }

    // The environment gets concatenated below the meta-data downstream.
    if !c.cloud_init_meta_data.is_empty() && !c.environment.is_empty() {
        c.cloud_init_meta_data.push('\n');
    }
}

/// Map the CRI resource block onto the manager limits. CRI zero values mean
/// unspecified and keep the manager default.
pub fn apply_resources(c: &mut Container, resources: Option<&api::LinuxContainerResources>) {
    let resources = match resources {
        Some(r) => r,
        None => return,
    };
    c.resources = Some(ContainerResources {
        cpu_shares: (resources.cpu_shares > 0).then_some(resources.cpu_shares as u64),
        cpu_quota: (resources.cpu_quota > 0).then_some(resources.cpu_quota),
        cpu_period: (resources.cpu_period > 0).then_some(resources.cpu_period as u64),
        memory_limit_bytes: (resources.memory_limit_in_bytes > 0)
            .then_some(resources.memory_limit_in_bytes),
    });
}

pub fn to_cri_container(c: &Container) -> api::Container {
    api::Container {
        id: c.id.clone(),
        pod_sandbox_id: c.sandbox_id().to_string(),
        metadata: Some(api::ContainerMetadata {
            name: c.metadata.name.clone(),
            attempt: c.metadata.attempt,
        }),
        image: Some(api::ImageSpec {
            image: c.image.clone(),
            ..Default::default()
        }),
        image_ref: c.image.clone(),
        state: state_container_as_cri(c.state.name),
        created_at: ts_nanos(c.created_at),
        labels: c.labels.clone(),
        annotations: c.annotations.clone(),
    }
}

pub fn to_cri_status_response(c: &Container) -> api::ContainerStatusResponse {
    let status = api::ContainerStatus {
        id: c.id.clone(),
        metadata: Some(api::ContainerMetadata {
            name: c.metadata.name.clone(),
            attempt: c.metadata.attempt,
        }),
        state: state_container_as_cri(c.state.name),
        created_at: ts_nanos(c.created_at),
        started_at: ts_nanos(c.started_at),
        finished_at: ts_nanos(c.finished_at),
        image: Some(api::ImageSpec {
            image: c.image.clone(),
            ..Default::default()
        }),
        image_ref: c.image.clone(),
        labels: c.labels.clone(),
        annotations: c.annotations.clone(),
        log_path: c.log_path.clone(),
        ..Default::default()
    };

    api::ContainerStatusResponse {
        status: Some(status),
        info: HashMap::new(),
    }
}

/// Convert manager usage counters into a CRI stats entry. All three series
/// share one collection timestamp; counters the manager did not report are
/// zero, never absent.
pub fn to_cri_stats(c: &Container) -> api::ContainerStats {
    let now = OffsetDateTime::now_utc().unix_timestamp_nanos() as i64;

    api::ContainerStats {
        attributes: Some(api::ContainerAttributes {
            id: c.id.clone(),
            metadata: Some(api::ContainerMetadata {
                name: c.metadata.name.clone(),
                attempt: c.metadata.attempt,
            }),
            labels: c.labels.clone(),
            annotations: c.annotations.clone(),
        }),
        cpu: Some(api::CpuUsage {
            timestamp: now,
            usage_core_nano_seconds: Some(api::UInt64Value {
                value: c.state.stats.cpu_usage,
            }),
        }),
        memory: Some(api::MemoryUsage {
            timestamp: now,
            working_set_bytes: Some(api::UInt64Value {
                value: c.state.stats.memory_usage,
            }),
        }),
        writable_layer: Some(api::FilesystemUsage {
            timestamp: now,
            fs_id: None,
            used_bytes: Some(api::UInt64Value {
                value: c.state.stats.filesystem_usage,
            }),
            inodes_used: Some(api::UInt64Value { value: 0 }),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ContainerStats;

    #[test]
    fn test_container_state_bijection() {
        let states = [
            (ContainerStateName::Created, api::ContainerState::ContainerCreated),
            (ContainerStateName::Running, api::ContainerState::ContainerRunning),
            (ContainerStateName::Exited, api::ContainerState::ContainerExited),
            (ContainerStateName::Unknown, api::ContainerState::ContainerUnknown),
        ];
        for (name, cri) in states {
            assert_eq!(state_container_as_cri(name), cri as i32);
            // case-insensitive on the manager side
            assert_eq!(
                state_container_as_cri(ContainerStateName::parse(
                    &name.as_str().to_uppercase()
                )),
                cri as i32
            );
        }
    }

    #[test]
    fn test_sandbox_state_mapping() {
        assert_eq!(
            state_sandbox_as_cri(SandboxState::Ready),
            api::PodSandboxState::SandboxReady as i32
        );
        assert_eq!(
            state_sandbox_as_cri(SandboxState::NotReady),
            api::PodSandboxState::SandboxNotready as i32
        );
    }

    #[test]
    fn test_namespace_mode_round_trip() {
        for mode in [
            api::NamespaceMode::Pod,
            api::NamespaceMode::Container,
            api::NamespaceMode::Node,
            api::NamespaceMode::Target,
        ] {
            let name = namespace_mode_name(mode as i32);
            assert_eq!(name, name.to_lowercase());
            assert_eq!(namespace_mode_from_name(&name), mode as i32);
        }
        // unknown names land on the proto zero value
        assert_eq!(namespace_mode_from_name("galaxy"), 0);
    }

    #[test]
    fn test_namespace_options_encode_decode() {
        let mut sb = Sandbox::default();
        encode_linux_config(
            &mut sb,
            &api::LinuxPodSandboxConfig {
                security_context: Some(api::LinuxSandboxSecurityContext {
                    namespace_options: Some(api::NamespaceOption {
                        network: api::NamespaceMode::Node as i32,
                        pid: api::NamespaceMode::Container as i32,
                        ipc: api::NamespaceMode::Pod as i32,
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );

        assert_eq!(
            sb.config
                .get("user.linux.security_context.namespace_options.network")
                .unwrap(),
            "node"
        );

        let ns = decode_namespace_options(&sb.config).unwrap();
        let options = ns.options.unwrap();
        assert_eq!(options.network, api::NamespaceMode::Node as i32);
        assert_eq!(options.pid, api::NamespaceMode::Container as i32);
        assert_eq!(options.ipc, api::NamespaceMode::Pod as i32);
    }

    #[test]
    fn test_decode_without_namespace_keys() {
        let config = HashMap::from([("user.linux.cgroup_parent".to_string(), "/k8s".to_string())]);
        assert!(decode_namespace_options(&config).is_none());
    }

    #[test]
    fn test_selinux_shares_namespace_options_prefix() {
        let mut sb = Sandbox::default();
        encode_linux_config(
            &mut sb,
            &api::LinuxPodSandboxConfig {
                security_context: Some(api::LinuxSandboxSecurityContext {
                    selinux_options: Some(api::SeLinuxOption {
                        role: "object_r".to_string(),
                        level: "s0".to_string(),
                        user: "system_u".to_string(),
                        r#type: "svirt_lxc_net_t".to_string(),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );

        assert_eq!(
            sb.config
                .get("user.linux.security_context.namespace_options.role")
                .unwrap(),
            "object_r"
        );
        // SELinux keys must not fabricate namespace options on decode
        assert!(decode_namespace_options(&sb.config).is_none());
    }

    #[test]
    fn test_privileged_written_to_both_keys() {
        let mut sb = Sandbox::default();
        encode_linux_config(
            &mut sb,
            &api::LinuxPodSandboxConfig {
                security_context: Some(api::LinuxSandboxSecurityContext {
                    privileged: true,
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        assert_eq!(
            sb.config.get("user.linux.security_context.privileged").unwrap(),
            "true"
        );
        assert_eq!(sb.config.get("security.privileged").unwrap(), "true");
    }

    #[test]
    fn test_readonly_rootfs_injects_root_disk() {
        let mut sb = Sandbox::default();
        encode_linux_config(
            &mut sb,
            &api::LinuxPodSandboxConfig {
                security_context: Some(api::LinuxSandboxSecurityContext {
                    readonly_rootfs: true,
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        let disk = sb.devices.disks().next().unwrap();
        assert_eq!(disk.path, "/");
        assert!(disk.readonly);
        assert_eq!(disk.pool, "default");
    }

    #[test]
    fn test_sysctls_and_cgroup_parent_keys() {
        let mut sb = Sandbox::default();
        encode_linux_config(
            &mut sb,
            &api::LinuxPodSandboxConfig {
                cgroup_parent: "/kubepods/pod1".to_string(),
                sysctls: HashMap::from([(
                    "net.ipv4.ip_forward".to_string(),
                    "1".to_string(),
                )]),
                security_context: None,
            },
        );
        assert_eq!(sb.config.get("user.linux.cgroup_parent").unwrap(), "/kubepods/pod1");
        assert_eq!(
            sb.config.get("user.linux.sysctls.net.ipv4.ip_forward").unwrap(),
            "1"
        );
    }

    #[test]
    fn test_mount_path_rewriting_is_total() {
        assert_eq!(rewrite_container_path("/var/run/secrets"), "/mnt/secrets");
        assert_eq!(rewrite_container_path("/run/lock"), "/mnt/lock");
        assert_eq!(rewrite_container_path("/var/run"), "/mnt");
        assert_eq!(rewrite_container_path("/run"), "/mnt");
        assert_eq!(rewrite_container_path("/data"), "/data");
        assert_eq!(rewrite_container_path("/var/lib/run"), "/var/lib/run");

        for p in ["/var/run/a", "/run/b", "/var/run", "/run"] {
            let rewritten = rewrite_container_path(p);
            assert!(!rewritten.starts_with("/var/run") && !rewritten.starts_with("/run"));
        }
    }

    #[test]
    fn test_network_mode_name_round_trip() {
        for mode in [
            NetworkMode::Bridged,
            NetworkMode::Cni,
            NetworkMode::Host,
            NetworkMode::None,
        ] {
            assert_eq!(NetworkMode::parse(mode.as_str()), mode);
        }
        // unknown names land on the default mode
        assert_eq!(NetworkMode::parse("vlan"), NetworkMode::Bridged);
    }

    #[test]
    fn test_network_config_round_trip() {
        let mut sb = Sandbox::default();
        sb.network = NetworkConfig {
            mode: NetworkMode::Host,
            mode_data: r#"{"netns":"lxe-sb1"}"#.to_string(),
            nameservers: vec!["10.0.0.10".to_string(), "10.0.0.11".to_string()],
            searches: vec!["cluster.local".to_string()],
        };
        encode_network_config(&mut sb);

        assert_eq!(
            sb.config.get("user.linux.network_config.mode").unwrap(),
            "host"
        );
        assert_eq!(
            sb.config.get("user.linux.network_config.nameservers").unwrap(),
            "10.0.0.10,10.0.0.11"
        );
        assert_eq!(decode_network_config(&sb.config), sb.network);
    }

    #[test]
    fn test_decode_network_config_defaults() {
        let decoded = decode_network_config(&HashMap::new());
        assert_eq!(decoded.mode, NetworkMode::Bridged);
        assert!(decoded.mode_data.is_empty());
        assert!(decoded.nameservers.is_empty());
        assert!(decoded.searches.is_empty());
    }

    #[test]
    fn test_port_mapping_translation() {
        let mut sb = Sandbox::default();
        apply_port_mappings(
            &mut sb,
            &[
                api::PortMapping {
                    protocol: api::Protocol::Tcp as i32,
                    container_port: 80,
                    host_port: 8080,
                    host_ip: String::new(),
                },
                // zero container port: dropped
                api::PortMapping {
                    protocol: api::Protocol::Tcp as i32,
                    container_port: 0,
                    host_port: 9090,
                    host_ip: String::new(),
                },
                // zero host port: dropped
                api::PortMapping {
                    protocol: api::Protocol::Tcp as i32,
                    container_port: 80,
                    host_port: 0,
                    host_ip: String::new(),
                },
            ],
        );

        let proxies: Vec<_> = sb.devices.proxies().collect();
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].listen.to_string(), "tcp:0.0.0.0:8080");
        assert_eq!(proxies[0].destination.to_string(), "tcp:127.0.0.1:80");
    }

    #[test]
    fn test_port_mapping_udp_and_unknown_protocol() {
        let mut sb = Sandbox::default();
        apply_port_mappings(
            &mut sb,
            &[
                api::PortMapping {
                    protocol: api::Protocol::Udp as i32,
                    container_port: 53,
                    host_port: 53,
                    host_ip: "10.0.0.1".to_string(),
                },
                // SCTP and out-of-range values fall back to tcp
                api::PortMapping {
                    protocol: 42,
                    container_port: 81,
                    host_port: 8081,
                    host_ip: String::new(),
                },
            ],
        );

        let proxies: Vec<_> = sb.devices.proxies().collect();
        assert_eq!(proxies[0].listen.to_string(), "udp:10.0.0.1:53");
        assert_eq!(proxies[1].listen.protocol, Protocol::Tcp);
    }

    #[test]
    fn test_environment_cloud_init_extraction() {
        let mut c = Container::default();
        apply_environment(
            &mut c,
            &[
                api::KeyValue {
                    key: "user-data".to_string(),
                    value: "#cloud-config\npackages: [curl]".to_string(),
                },
                api::KeyValue {
                    key: "FOO".to_string(),
                    value: "bar".to_string(),
                },
            ],
        );

        assert_eq!(c.cloud_init_user_data, "#cloud-config\npackages: [curl]");
        assert_eq!(c.environment.get("FOO").unwrap(), "bar");
        assert!(!c.environment.contains_key("user-data"));
    }

    #[test]
    fn test_meta_data_trailing_newline() {
        let mut c = Container::default();
        apply_environment(
            &mut c,
            &[
                api::KeyValue {
                    key: "meta-data".to_string(),
                    value: "instance-id: i1".to_string(),
                },
                api::KeyValue {
                    key: "FOO".to_string(),
                    value: "bar".to_string(),
                },
            ],
        );
        assert_eq!(c.cloud_init_meta_data, "instance-id: i1\n");

        // no environment left over: no newline appended
        let mut c = Container::default();
        apply_environment(
            &mut c,
            &[api::KeyValue {
                key: "meta-data".to_string(),
                value: "instance-id: i1".to_string(),
            }],
        );
        assert_eq!(c.cloud_init_meta_data, "instance-id: i1");
    }

    #[test]
    fn test_resources_zero_means_unset() {
        let mut c = Container::default();
        apply_resources(
            &mut c,
            Some(&api::LinuxContainerResources {
                cpu_shares: 512,
                memory_limit_in_bytes: 1 << 30,
                ..Default::default()
            }),
        );
        let r = c.resources.unwrap();
        assert_eq!(r.cpu_shares, Some(512));
        assert_eq!(r.memory_limit_bytes, Some(1 << 30));
        assert_eq!(r.cpu_quota, None);
        assert_eq!(r.cpu_period, None);

        let mut c = Container::default();
        apply_resources(&mut c, None);
        assert!(c.resources.is_none());
    }

    #[test]
    fn test_compare_filter_map() {
        let base = HashMap::from([
            ("app".to_string(), "web".to_string()),
            ("tier".to_string(), "frontend".to_string()),
        ]);
        assert!(compare_filter_map(&base, &HashMap::new()));
        assert!(compare_filter_map(
            &base,
            &HashMap::from([("app".to_string(), "web".to_string())])
        ));
        assert!(!compare_filter_map(
            &base,
            &HashMap::from([("app".to_string(), "db".to_string())])
        ));
        assert!(!compare_filter_map(
            &base,
            &HashMap::from([("zone".to_string(), "a".to_string())])
        ));
    }

    #[test]
    fn test_stats_share_timestamp_and_zero_fill() {
        let mut c = Container::default();
        c.state.stats = ContainerStats {
            cpu_usage: 100,
            memory_usage: 0,
            filesystem_usage: 0,
        };
        let stats = to_cri_stats(&c);
        let cpu = stats.cpu.unwrap();
        let memory = stats.memory.unwrap();
        let disk = stats.writable_layer.unwrap();

        assert_eq!(cpu.timestamp, memory.timestamp);
        assert_eq!(memory.timestamp, disk.timestamp);
        assert_eq!(cpu.usage_core_nano_seconds.unwrap().value, 100);
        // missing counters are zero, not omitted
        assert_eq!(memory.working_set_bytes.unwrap().value, 0);
        assert_eq!(disk.used_bytes.unwrap().value, 0);
    }

    #[test]
    fn test_append_if_set_composes_lines() {
        let mut config = HashMap::new();
        append_if_set(&mut config, "raw.lxc", "lxc.include = /etc/a.conf");
        append_if_set(&mut config, "raw.lxc", "lxc.include = /etc/b.conf");
        assert_eq!(
            config.get("raw.lxc").unwrap(),
            "lxc.include = /etc/a.conf\nlxc.include = /etc/b.conf"
        );
    }
}
