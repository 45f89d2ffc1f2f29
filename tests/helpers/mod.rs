use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use rspuppet::config::BuildContext;
use rspuppet::executor::{CommandExecutor, CommandResult, CommandSpec};
use rspuppet::isolation::{ChrootProvider, IsolationContext, IsolationProvider};

/// Executor returning scripted exit codes per program and recording every argv.
///
/// Commands run through `chroot <rootfs>` are matched on the program inside
/// the chroot. Programs without a script exit with 0.
#[allow(dead_code)]
#[derive(Default)]
pub struct MockExecutor {
    calls: Mutex<Vec<Vec<String>>>,
    envs: Mutex<Vec<Vec<(String, String)>>>,
    exit_codes: Vec<(&'static str, i32)>,
    erroring: Option<&'static str>,
    stderr: String,
    before_run: Option<(&'static str, Box<dyn Fn() + Send + Sync>)>,
}

#[allow(dead_code)]
impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `program` exit with `code`.
    pub fn with_exit_code(mut self, program: &'static str, code: i32) -> Self {
        self.exit_codes.push((program, code));
        self
    }

    /// Makes executing `program` return an error instead of a result.
    pub fn with_error(mut self, program: &'static str) -> Self {
        self.erroring = Some(program);
        self
    }

    /// Runs `action` right before `program` is executed.
    pub fn with_action(
        mut self,
        program: &'static str,
        action: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        self.before_run = Some((program, Box::new(action)));
        self
    }

    pub fn with_stderr(mut self, stderr: &str) -> Self {
        self.stderr = stderr.to_string();
        self
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Returns the extra environment of every call, in call order.
    pub fn envs(&self) -> Vec<Vec<(String, String)>> {
        self.envs.lock().unwrap().clone()
    }

    /// Returns the argv executed inside the chroot, without the `chroot <rootfs>` prefix.
    pub fn chroot_calls(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|argv| argv[0] == "chroot")
            .map(|argv| argv[2..].to_vec())
            .collect()
    }

    fn program(argv: &[String]) -> &str {
        if argv[0] == "chroot" {
            argv.get(2).map(String::as_str).unwrap_or("")
        } else {
            &argv[0]
        }
    }
}

impl CommandExecutor for MockExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<CommandResult> {
        let argv = spec.argv();
        self.calls.lock().unwrap().push(argv.clone());
        self.envs.lock().unwrap().push(spec.env.clone());

        let program = Self::program(&argv);
        if let Some((name, action)) = &self.before_run
            && *name == program
        {
            action();
        }
        if self.erroring == Some(program) {
            anyhow::bail!("failed to spawn {}", program);
        }
        let code = self
            .exit_codes
            .iter()
            .find(|(name, _)| *name == program)
            .map_or(0, |(_, code)| *code);

        let mut result = CommandResult::from_status(Some(ExitStatus::from_raw(code << 8)));
        if code != 0 {
            result.stderr = self.stderr.clone();
        }
        Ok(result)
    }
}

/// Observations made by [`CountingProvider`] contexts.
#[allow(dead_code)]
#[derive(Default)]
pub struct ScopeLog {
    pub setups: AtomicUsize,
    pub teardowns: AtomicUsize,
    /// Files under the staged ssl tree when the scope was entered, relative to it.
    pub ssl_files_at_setup: Mutex<Vec<String>>,
    /// Whether the staged ssl tree existed when the scope was released.
    pub ssl_present_at_teardown: Mutex<Option<bool>>,
}

/// Chroot provider without pseudo filesystem mounts that counts scope entries and releases.
#[allow(dead_code)]
pub struct CountingProvider {
    inner: ChrootProvider,
    pub log: Arc<ScopeLog>,
    fail_setup: bool,
}

#[allow(dead_code)]
impl CountingProvider {
    pub fn new() -> Self {
        Self {
            inner: ChrootProvider::without_mounts(),
            log: Arc::new(ScopeLog::default()),
            fail_setup: false,
        }
    }

    pub fn failing_setup() -> Self {
        Self {
            fail_setup: true,
            ..Self::new()
        }
    }
}

impl IsolationProvider for CountingProvider {
    fn name(&self) -> &'static str {
        "counting-chroot"
    }

    fn setup(
        &self,
        rootfs: &Utf8Path,
        executor: Arc<dyn CommandExecutor>,
        dry_run: bool,
    ) -> Result<Box<dyn IsolationContext>> {
        self.log.setups.fetch_add(1, Ordering::SeqCst);
        *self.log.ssl_files_at_setup.lock().unwrap() = staged_ssl_files(rootfs);
        if self.fail_setup {
            anyhow::bail!("cannot enter chroot at {}", rootfs);
        }
        let inner = self.inner.setup(rootfs, executor, dry_run)?;
        Ok(Box::new(CountingContext {
            inner,
            rootfs: rootfs.to_owned(),
            log: self.log.clone(),
        }))
    }
}

/// Lists `certs/*` and `private_keys/*` of the ssl tree under `rootfs`, sorted.
fn staged_ssl_files(rootfs: &Utf8Path) -> Vec<String> {
    let ssl_dir = rootfs.join(rspuppet::certs::SSL_DIR);
    let mut files = Vec::new();
    for subdir in ["certs", "private_keys"] {
        let Ok(entries) = ssl_dir.join(subdir).read_dir_utf8() else {
            continue;
        };
        for entry in entries {
            let entry = entry.unwrap();
            files.push(format!("{}/{}", subdir, entry.file_name()));
        }
    }
    files.sort();
    files
}

#[allow(dead_code)]
struct CountingContext {
    inner: Box<dyn IsolationContext>,
    rootfs: Utf8PathBuf,
    log: Arc<ScopeLog>,
}

impl IsolationContext for CountingContext {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn execute_with_env(
        &self,
        command: &[String],
        env: &[(String, String)],
    ) -> Result<CommandResult> {
        self.inner.execute_with_env(command, env)
    }

    fn teardown(&mut self) -> Result<()> {
        self.log.teardowns.fetch_add(1, Ordering::SeqCst);
        let ssl_dir = self.rootfs.join(rspuppet::certs::SSL_DIR);
        *self.log.ssl_present_at_teardown.lock().unwrap() = Some(ssl_dir.exists());
        self.inner.teardown()
    }
}

/// Temporary workspace holding a mount root and host-side inputs.
#[allow(dead_code)]
pub struct Workspace {
    _dir: tempfile::TempDir,
    pub root: Utf8PathBuf,
}

#[allow(dead_code)]
impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .expect("temp dir path should be valid UTF-8");
        fs::create_dir_all(root.join("image/etc")).expect("failed to create mount root");
        Self { _dir: dir, root }
    }

    pub fn mount_root(&self) -> Utf8PathBuf {
        self.root.join("image")
    }

    /// Writes a host-side ssl tree holding certificates for `certname`.
    pub fn ssl_source(&self, certname: &str) -> Utf8PathBuf {
        let ssl = self.root.join("host-ssl");
        fs::create_dir_all(ssl.join("certs")).unwrap();
        fs::create_dir_all(ssl.join("private_keys")).unwrap();
        fs::write(ssl.join("certs/ca.pem"), "CA").unwrap();
        fs::write(ssl.join(format!("certs/{}.pem", certname)), "CERT").unwrap();
        fs::write(ssl.join(format!("private_keys/{}.pem", certname)), "KEY").unwrap();
        ssl
    }

    /// Writes a plain manifest file named `name`.
    pub fn manifest(&self, name: &str) -> Utf8PathBuf {
        let path = self.root.join(name);
        fs::write(&path, "node default { notify { 'hello': } }\n").unwrap();
        path
    }

    /// Writes a tar archive with the given `(path, contents)` entries.
    pub fn archive(&self, name: &str, entries: &[(&str, &str)]) -> Utf8PathBuf {
        let path = self.root.join(name);
        let file = fs::File::create(&path).unwrap();
        let mut builder = tar::Builder::new(file);
        for (entry_path, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, entry_path, contents.as_bytes())
                .unwrap();
        }
        builder.finish().unwrap();
        path
    }

    /// Returns a master-mode context for `certname` against `server`.
    pub fn master_context(&self, certname: &str, server: &str) -> BuildContext {
        let mut context = BuildContext::new(self.mount_root());
        context.package.arg = certname.to_string();
        context.puppet.master_hostname = Some(server.to_string());
        context.puppet.ssl_source = Some(self.ssl_source(certname));
        context
    }

    /// Returns an apply-mode context for `manifests`.
    pub fn apply_context(&self, manifests: Utf8PathBuf) -> BuildContext {
        let mut context = BuildContext::new(self.mount_root());
        context.package.arg = "web-01".to_string();
        context.puppet.manifests = Some(manifests);
        context
    }
}
