// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Docker implementation of [`ContainerEngine`] over `bollard`.

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, Stats, StatsOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum, PortBinding as DockerPortBinding, Volume};
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions};
use bollard::Docker;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::domain::engine::{
    AttachedIo, ContainerEngine, ContainerSpec, EngineError, ShellSpec, StopGrace, VolumeInfo,
};
use crate::domain::telemetry::StatsSample;

/// Label put on every container the agent creates.
pub const MANAGED_LABEL: &str = "ai.100monkeys.hearth.managed";

pub struct DockerEngine {
    docker: Docker,
}

fn engine_error(err: DockerError, object: &str) -> EngineError {
    match err {
        DockerError::DockerResponseServerError { status_code: 404, message } => {
            EngineError::NotFound(format!("{}: {}", object, message))
        }
        DockerError::DockerResponseServerError { status_code: 409, message } => {
            EngineError::Conflict(format!("{}: {}", object, message))
        }
        DockerError::DockerResponseServerError { status_code, message } => {
            EngineError::Api(format!("{} ({}): {}", object, status_code, message))
        }
        err @ (DockerError::IOError { .. }
        | DockerError::HyperResponseError { .. }
        | DockerError::SocketNotFoundError(_)) => {
            EngineError::Connection(format!("{}: {}", object, err))
        }
        other => EngineError::Api(format!("{}: {}", object, other)),
    }
}

/// 304 means the container already is in the requested state.
fn not_modified_is_ok(result: Result<(), DockerError>, object: &str) -> Result<(), EngineError> {
    match result {
        Ok(()) => Ok(()),
        Err(DockerError::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
        Err(e) => Err(engine_error(e, object)),
    }
}

fn volume_info(volume: Volume) -> VolumeInfo {
    VolumeInfo {
        name: volume.name,
        mountpoint: PathBuf::from(volume.mountpoint),
    }
}

fn sample_from(stats: &Stats) -> StatsSample {
    StatsSample {
        cpu_total_usage: stats.cpu_stats.cpu_usage.total_usage,
        precpu_total_usage: stats.precpu_stats.cpu_usage.total_usage,
        system_cpu_usage: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
        presystem_cpu_usage: stats.precpu_stats.system_cpu_usage.unwrap_or(0),
        memory_usage_bytes: stats.memory_stats.usage.unwrap_or(0),
    }
}

fn output_bytes(
    output: impl futures::Stream<Item = Result<LogOutput, DockerError>> + Send + 'static,
    object: String,
) -> BoxStream<'static, Result<Bytes, EngineError>> {
    output
        .map(move |frame| match frame {
            Ok(frame) => Ok(frame.into_bytes()),
            Err(e) => Err(engine_error(e, &object)),
        })
        .boxed()
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
    let mut port_bindings: HashMap<String, Option<Vec<DockerPortBinding>>> = HashMap::new();
    for binding in &spec.ports {
        let key = binding.container_port_key();
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings
            .entry(key)
            .or_insert_with(|| Some(Vec::new()))
            .get_or_insert_with(Vec::new)
            .push(DockerPortBinding {
                host_ip: Some(binding.host_ip.clone()),
                host_port: Some(binding.port.to_string()),
            });
    }

    let mut env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    env.sort();

    let host_config = HostConfig {
        mounts: Some(vec![Mount {
            target: Some(spec.mount.target.clone()),
            source: Some(spec.mount.volume.clone()),
            typ: Some(MountTypeEnum::VOLUME),
            read_only: Some(false),
            ..Default::default()
        }]),
        memory: Some(spec.ceilings.memory_bytes),
        memory_swap: Some(spec.ceilings.memory_swap_bytes),
        cpu_quota: spec.ceilings.cpu_quota_us,
        cpu_period: spec.ceilings.cpu_period_us,
        port_bindings: if port_bindings.is_empty() { None } else { Some(port_bindings) },
        network_mode: spec.network.clone(),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        cmd: if spec.cmd.is_empty() { None } else { Some(spec.cmd.clone()) },
        env: Some(env),
        working_dir: spec.working_dir.clone(),
        tty: Some(true),
        open_stdin: Some(true),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        exposed_ports: if exposed_ports.is_empty() { None } else { Some(exposed_ports) },
        labels: Some(HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())])),
        host_config: Some(host_config),
        ..Default::default()
    }
}

impl DockerEngine {
    /// Connect to the daemon at `socket_path`, or auto-detect when unset.
    pub fn connect(socket_path: Option<&str>) -> Result<Self, EngineError> {
        let docker = match socket_path {
            Some(path) => Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| {
                    EngineError::Connection(format!(
                        "Failed to connect to Docker at {}: {}\n\n\
                         Ensure Docker is running and the socket path is correct.",
                        path, e
                    ))
                })?,
            None => Docker::connect_with_local_defaults().map_err(|e| {
                EngineError::Connection(format!(
                    "Failed to connect to Docker: {}\n\n\
                     Check that the daemon is running (docker ps) and that this \
                     user may access /var/run/docker.sock.",
                    e
                ))
            })?,
        };
        Ok(Self { docker })
    }

    /// Verify the daemon answers.
    pub async fn healthcheck(&self) -> Result<(), EngineError> {
        self.docker
            .ping()
            .await
            .map_err(|e| EngineError::Connection(format!("Cannot reach Docker daemon: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        info!(image = %image, "Pulling image");
        let options = Some(CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        });
        let mut progress = self.docker.create_image(options, None, None);
        while let Some(step) = progress.next().await {
            step.map_err(|e| engine_error(e, image))?;
        }
        debug!(image = %image, "Image ready");
        Ok(())
    }

    async fn list_volumes(&self, name: &str) -> Result<Vec<VolumeInfo>, EngineError> {
        let filters = HashMap::from([("name".to_string(), vec![name.to_string()])]);
        let response = self
            .docker
            .list_volumes(Some(ListVolumesOptions { filters }))
            .await
            .map_err(|e| engine_error(e, name))?;
        // the daemon's name filter matches substrings
        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .filter(|v| v.name == name)
            .map(volume_info)
            .collect())
    }

    async fn create_volume(&self, name: &str) -> Result<VolumeInfo, EngineError> {
        let volume = self
            .docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                driver: "local".to_string(),
                ..Default::default()
            })
            .await
            .map_err(|e| engine_error(e, name))?;
        Ok(volume_info(volume))
    }

    async fn inspect_volume(&self, name: &str) -> Result<VolumeInfo, EngineError> {
        let volume = self
            .docker
            .inspect_volume(name)
            .await
            .map_err(|e| engine_error(e, name))?;
        Ok(volume_info(volume))
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
            .map_err(|e| engine_error(e, name))
    }

    async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        self.docker
            .remove_network(name)
            .await
            .map_err(|e| engine_error(e, name))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(|e| engine_error(e, &spec.name))?;
        info!(container = %spec.name, image = %spec.image, "Container created");
        Ok(response.id)
    }

    async fn start_container(&self, name: &str) -> Result<(), EngineError> {
        not_modified_is_ok(
            self.docker
                .start_container(name, None::<StartContainerOptions<String>>)
                .await,
            name,
        )
    }

    async fn stop_container(&self, name: &str, grace: StopGrace) -> Result<(), EngineError> {
        let options = match grace {
            StopGrace::EngineDefault => None,
            StopGrace::Immediate => Some(StopContainerOptions { t: 0 }),
        };
        not_modified_is_ok(self.docker.stop_container(name, options).await, name)
    }

    async fn remove_container(&self, name: &str, force: bool) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_container(name, Some(options))
            .await
            .map_err(|e| engine_error(e, name))
    }

    async fn container_exists(&self, name: &str) -> Result<bool, EngineError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match engine_error(e, name) {
                EngineError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn is_running(&self, name: &str) -> Result<bool, EngineError> {
        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| engine_error(e, name))?;
        Ok(inspect.state.and_then(|s| s.running).unwrap_or(false))
    }

    async fn wait_until_stopped(&self, name: &str) -> Result<i64, EngineError> {
        let options = WaitContainerOptions {
            condition: "not-running".to_string(),
        };
        let mut wait = self.docker.wait_container(name, Some(options));
        match wait.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(engine_error(e, name)),
            None => Err(EngineError::Api(format!("{}: wait ended without a status", name))),
        }
    }

    async fn attach(&self, name: &str) -> Result<AttachedIo, EngineError> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            ..Default::default()
        };
        let AttachContainerResults { output, input } = self
            .docker
            .attach_container(name, Some(options))
            .await
            .map_err(|e| engine_error(e, name))?;
        Ok(AttachedIo {
            output: output_bytes(output, name.to_string()),
            input,
        })
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<Vec<String>, EngineError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let mut frames = self.docker.logs(name, Some(options));
        let mut buf: Vec<u8> = Vec::new();
        while let Some(frame) = frames.next().await {
            let frame = frame.map_err(|e| engine_error(e, name))?;
            buf.extend_from_slice(&frame.into_bytes());
        }
        Ok(String::from_utf8_lossy(&buf)
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn exec_shell(&self, name: &str, spec: &ShellSpec) -> Result<AttachedIo, EngineError> {
        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(spec.tty),
                    privileged: Some(spec.privileged),
                    user: Some(spec.user.clone()),
                    cmd: Some(spec.cmd.clone()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| engine_error(e, name))?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: spec.tty,
                    output_capacity: None,
                }),
            )
            .await
            .map_err(|e| engine_error(e, name))?;

        match started {
            StartExecResults::Attached { output, input } => Ok(AttachedIo {
                output: output_bytes(output, name.to_string()),
                input,
            }),
            StartExecResults::Detached => Err(EngineError::Api(format!(
                "{}: exec started detached",
                name
            ))),
        }
    }

    async fn stats(
        &self,
        name: &str,
    ) -> Result<BoxStream<'static, Result<StatsSample, EngineError>>, EngineError> {
        let object = name.to_string();
        let feed = self
            .docker
            .stats(
                name,
                Some(StatsOptions {
                    stream: true,
                    one_shot: false,
                }),
            )
            .map(move |reading| match reading {
                Ok(stats) => Ok(sample_from(&stats)),
                Err(e) => Err(engine_error(e, &object)),
            })
            .boxed();
        Ok(feed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::engine::{PortBinding, Protocol, ResourceCeilings, VolumeMount};

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "server_a".into(),
            image: "img:java21".into(),
            cmd: vec!["java".into(), "-jar".into(), "server.jar".into()],
            env: HashMap::from([
                ("SERVER_MEMORY".to_string(), "1024".to_string()),
                ("SERVER_BINARY".to_string(), "server.jar".to_string()),
            ]),
            working_dir: Some("/data".into()),
            mount: VolumeMount { volume: "server_a".into(), target: "/data".into() },
            ceilings: ResourceCeilings {
                memory_bytes: 1 << 30,
                memory_swap_bytes: 1 << 30,
                cpu_quota_us: Some(50_000),
                cpu_period_us: Some(100_000),
            },
            ports: vec![
                PortBinding { host_ip: "10.0.0.5".into(), port: 25565, protocol: Protocol::Tcp },
                PortBinding { host_ip: "10.0.0.5".into(), port: 25565, protocol: Protocol::Udp },
            ],
            network: None,
        }
    }

    #[test]
    fn test_container_config_carries_limits_ports_and_mount() {
        let config = container_config(&spec());
        assert_eq!(
            config.env.as_deref(),
            Some(&["SERVER_BINARY=server.jar".to_string(), "SERVER_MEMORY=1024".to_string()][..])
        );
        let exposed = config.exposed_ports.unwrap();
        assert!(exposed.contains_key("25565/tcp") && exposed.contains_key("25565/udp"));

        let host = config.host_config.unwrap();
        assert_eq!(host.cpu_quota, Some(50_000));
        assert_eq!(host.cpu_period, Some(100_000));
        assert_eq!(host.memory, Some(1 << 30));
        let bindings = host.port_bindings.unwrap();
        let tcp = bindings["25565/tcp"].as_ref().unwrap();
        assert_eq!(tcp[0].host_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(tcp[0].host_port.as_deref(), Some("25565"));
        let mount = &host.mounts.unwrap()[0];
        assert_eq!(mount.typ, Some(MountTypeEnum::VOLUME));
        assert_eq!(mount.source.as_deref(), Some("server_a"));
    }

    #[test]
    fn test_error_mapping() {
        let not_found = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "no such container".into(),
        };
        assert!(engine_error(not_found, "server_a").is_not_found());
        let conflict = DockerError::DockerResponseServerError {
            status_code: 409,
            message: "in use".into(),
        };
        assert!(matches!(engine_error(conflict, "server_a"), EngineError::Conflict(_)));
    }
}
