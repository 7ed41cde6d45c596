//! Running a job's executable script either bare or inside a container image. Mirrors the
//! piped-stdout/stderr capture idiom `maelstrom-go-test` uses for shelling out to `go build` -- here
//! adapted to `tokio::process` since the caller (`hither-parallel`) is already async, and
//! extended with a bind-mount list and a timeout since a job's container run is itself
//! cancellable.

use async_trait::async_trait;
use hither_base::ContainerImage;
use slog::{debug, Logger};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncReadExt as _;
use tokio::process::Command;

/// A host path made visible inside the container at `container_path`.
#[derive(Clone, Debug)]
pub struct BindMount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
}

/// The outcome of running a job's script, successful or not -- the exit code and captured
/// output are always returned; only a failure to even start the process (missing binary, image
/// pull failure) surfaces as an `Err`.
#[derive(Debug)]
pub struct RunOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// Abstraction over "run this script, optionally inside this container." Container
/// preparation (pulling/building an image once, then reusing it) is split out as `prepare`
/// so a handler can memoize it across many jobs that share an image.
#[async_trait]
pub trait ContainerRunner: Send + Sync {
    /// Ensures `image` is available to run. Called at most once per image per runner instance;
    /// callers that need cross-job memoization should wrap this in their own cache (see
    /// [`MemoizingContainerRunner`]).
    async fn prepare(&self, image: &ContainerImage) -> anyhow::Result<()>;

    async fn run(
        &self,
        working_dir: &Path,
        image: Option<&ContainerImage>,
        command: &[String],
        bind_mounts: &[BindMount],
        timeout: Duration,
    ) -> anyhow::Result<RunOutcome>;
}

/// Runs the job's command directly on the host, ignoring any container image. Used for
/// uncontainerized jobs and in tests, where spinning up an actual container daemon would be
/// disproportionate.
pub struct NullContainerRunner {
    log: Logger,
}

impl NullContainerRunner {
    pub fn new(log: Logger) -> Self {
        Self { log }
    }
}

#[async_trait]
impl ContainerRunner for NullContainerRunner {
    async fn prepare(&self, _image: &ContainerImage) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(
        &self,
        working_dir: &Path,
        _image: Option<&ContainerImage>,
        command: &[String],
        _bind_mounts: &[BindMount],
        timeout: Duration,
    ) -> anyhow::Result<RunOutcome> {
        debug!(self.log, "running uncontainerized"; "command" => ?command);
        run_command(working_dir, command, timeout).await
    }
}

/// The engine binary a container image's scheme selects. Exposed as a free function so
/// [`run_argv_prefix`] and callers that only need the mapping (not a full run) stay consistent
/// without duplicating it.
pub fn engine_for(image: &ContainerImage) -> &'static str {
    if image.as_str().starts_with("singularity://") {
        "singularity"
    } else {
        "docker"
    }
}

/// The `docker run`/`singularity run` argv prefix for `image` and `bind_mounts`, everything
/// before the command to execute inside the container.
pub fn run_argv_prefix(image: &ContainerImage, bind_mounts: &[BindMount]) -> Vec<String> {
    let engine = engine_for(image);
    let reference = image
        .as_str()
        .trim_start_matches("docker://")
        .trim_start_matches("singularity://");
    let mut args = vec![engine.to_string(), "run".into(), "--rm".into(), "-i".into()];
    for mount in bind_mounts {
        args.push("-v".into());
        args.push(format!(
            "{}:{}",
            mount.host_path.display(),
            mount.container_path.display()
        ));
    }
    args.push(reference.to_string());
    args
}

/// Shells out to `docker` or `singularity`, chosen by the image URI's scheme, the same way the
/// original Python implementation invokes them as subprocesses.
pub struct ProcessContainerRunner {
    log: Logger,
}

impl ProcessContainerRunner {
    pub fn new(log: Logger) -> Self {
        Self { log }
    }
}

#[async_trait]
impl ContainerRunner for ProcessContainerRunner {
    async fn prepare(&self, image: &ContainerImage) -> anyhow::Result<()> {
        let engine = engine_for(image);
        debug!(self.log, "pulling container image"; "image" => image.as_str(), "engine" => engine);
        let reference = image
            .as_str()
            .trim_start_matches("docker://")
            .trim_start_matches("singularity://");
        let status = Command::new(engine).arg("pull").arg(reference).status().await?;
        anyhow::ensure!(status.success(), "{engine} pull failed for {image}");
        Ok(())
    }

    async fn run(
        &self,
        working_dir: &Path,
        image: Option<&ContainerImage>,
        command: &[String],
        bind_mounts: &[BindMount],
        timeout: Duration,
    ) -> anyhow::Result<RunOutcome> {
        let Some(image) = image else {
            return run_command(working_dir, command, timeout).await;
        };
        debug!(self.log, "running containerized"; "image" => image.as_str(), "engine" => engine_for(image));
        let mut full_command = run_argv_prefix(image, bind_mounts);
        full_command.extend(command.iter().cloned());
        run_command(working_dir, &full_command, timeout).await
    }
}

async fn run_command(
    working_dir: &Path,
    command: &[String],
    timeout: Duration,
) -> anyhow::Result<RunOutcome> {
    let (program, rest) = command
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("empty command"))?;

    let mut child = Command::new(program)
        .args(rest)
        .current_dir(working_dir)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr was piped");
    let stdout_task = tokio::spawn(async move {
        let mut buf = String::new();
        let _ = stdout_pipe.read_to_string(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        let _ = stderr_pipe.read_to_string(&mut buf).await;
        buf
    });

    let wait_result = tokio::time::timeout(timeout, child.wait()).await;
    let timed_out = wait_result.is_err();
    if timed_out {
        let _ = child.kill().await;
    }
    let exit_code = match wait_result {
        Ok(Ok(status)) => status.code(),
        _ => None,
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    Ok(RunOutcome {
        exit_code,
        stdout,
        stderr,
        timed_out,
    })
}

/// Wraps a [`ContainerRunner`] with instance-owned memoization of `prepare`, replacing the
/// Python source's module-level preparation cache with an explicit, per-handler one.
pub struct MemoizingContainerRunner<R> {
    inner: R,
    prepared: Mutex<HashSet<ContainerImage>>,
}

impl<R: ContainerRunner> MemoizingContainerRunner<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            prepared: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl<R: ContainerRunner> ContainerRunner for MemoizingContainerRunner<R> {
    async fn prepare(&self, image: &ContainerImage) -> anyhow::Result<()> {
        if self
            .prepared
            .lock()
            .expect("memoizing runner mutex poisoned")
            .contains(image)
        {
            return Ok(());
        }
        self.inner.prepare(image).await?;
        self.prepared
            .lock()
            .expect("memoizing runner mutex poisoned")
            .insert(image.clone());
        Ok(())
    }

    async fn run(
        &self,
        working_dir: &Path,
        image: Option<&ContainerImage>,
        command: &[String],
        bind_mounts: &[BindMount],
        timeout: Duration,
    ) -> anyhow::Result<RunOutcome> {
        self.inner
            .run(working_dir, image, command, bind_mounts, timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hither_util::discard_logger;

    #[tokio::test]
    async fn null_runner_captures_stdout_and_exit_code() {
        let runner = NullContainerRunner::new(discard_logger());
        let outcome = runner
            .run(
                Path::new("."),
                None,
                &["echo".to_string(), "hi".to_string()],
                &[],
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout.trim(), "hi");
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn null_runner_reports_timeout() {
        let runner = NullContainerRunner::new(discard_logger());
        let outcome = runner
            .run(
                Path::new("."),
                None,
                &["sleep".to_string(), "5".to_string()],
                &[],
                Duration::from_millis(50),
            )
            .await
            .unwrap();
        assert!(outcome.timed_out);
    }

    #[tokio::test]
    async fn memoizing_runner_only_prepares_once() {
        struct CountingRunner(std::sync::atomic::AtomicUsize);
        #[async_trait]
        impl ContainerRunner for CountingRunner {
            async fn prepare(&self, _image: &ContainerImage) -> anyhow::Result<()> {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
            async fn run(
                &self,
                _working_dir: &Path,
                _image: Option<&ContainerImage>,
                _command: &[String],
                _bind_mounts: &[BindMount],
                _timeout: Duration,
            ) -> anyhow::Result<RunOutcome> {
                unreachable!()
            }
        }

        let runner = MemoizingContainerRunner::new(CountingRunner(std::sync::atomic::AtomicUsize::new(0)));
        let image = ContainerImage::parse("docker://img").unwrap();
        runner.prepare(&image).await.unwrap();
        runner.prepare(&image).await.unwrap();
        assert_eq!(runner.inner.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
