//! Command lines for puppet operations.
//!
//! Every command is built as a list of argument tokens, never as a shell
//! string, so certnames, hostnames and paths are passed through verbatim.

/// Name of the configuration tool binary inside the chroot.
pub const PUPPET_BINARY: &str = "puppet";

/// Apply arguments used when none are configured.
pub const DEFAULT_APPLY_ARGS: &str = "--debug";

/// A puppet operation that can be turned into an argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PuppetCommand<'a> {
    /// One-shot agent run against a puppet master.
    Agent { certname: &'a str, server: &'a str },
    /// Local apply of a staged manifest or module tree.
    ///
    /// `apply_args` is split on whitespace; an empty `target` is omitted.
    Apply { apply_args: &'a str, target: &'a str },
    /// Master-side certificate generation, run on the host.
    GenerateCertificate { certname: &'a str },
}

impl PuppetCommand<'_> {
    /// Builds the argv for this command (`argv[0]` is the binary).
    pub fn argv(&self) -> Vec<String> {
        let mut argv: Vec<String> = Vec::new();
        match self {
            Self::Agent { certname, server } => {
                argv.extend(
                    [
                        PUPPET_BINARY,
                        "agent",
                        "--detailed-exitcodes",
                        "--no-daemonize",
                        "--logdest",
                        "console",
                        "--onetime",
                        "--certname",
                        *certname,
                        "--server",
                        *server,
                    ]
                    .map(String::from),
                );
            }
            Self::Apply { apply_args, target } => {
                argv.extend(
                    [
                        PUPPET_BINARY,
                        "apply",
                        "--detailed-exitcodes",
                        "--logdest",
                        "console",
                        "--verbose",
                    ]
                    .map(String::from),
                );
                argv.extend(apply_args.split_whitespace().map(String::from));
                if !target.is_empty() {
                    argv.push(target.to_string());
                }
            }
            Self::GenerateCertificate { certname } => {
                argv.extend(["puppetca", "generate", *certname].map(String::from));
            }
        }
        argv
    }

    /// Short label used in logs and error messages.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Agent { .. } => "puppet agent",
            Self::Apply { .. } => "puppet apply",
            Self::GenerateCertificate { .. } => "puppetca generate",
        }
    }
}
