//! Compiling containers into systemd units for fleet.
//!
//! The compiled unit pulls the image, removes any stale container of the
//! same name, then runs the container with restart-on-failure. fleet only
//! places it on machines whose metadata carries the worker role. The spec
//! hash of the container is recorded in an `[X-Flotilla]` section so the
//! reconciler can detect drift from the unit list alone.

use std::fmt::Write as _;
use std::time::Duration;

use flotilla_id::JobName;
use flotilla_reconcile::SpecHash;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::Container;

/// Suffix fleet requires on unit names.
pub const UNIT_SUFFIX: &str = ".service";

/// Default machine metadata role eligible for units.
pub const DEFAULT_WORKER_ROLE: &str = "flotilla_minion";

/// Default `TimeoutStartSec`, long enough for a cold image pull.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const DOCKER: &str = "/usr/bin/docker";
const HASH_SECTION: &str = "X-Flotilla";
const HASH_OPTION: &str = "SpecHash";

/// Errors compiling a single container.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("image '{0}' has an empty repository or tag")]
    EmptyImage(String),

    #[error("invalid environment variable name '{0}'")]
    InvalidEnvKey(String),

    #[error("{0} contains a newline or NUL byte")]
    ControlCharacter(String),
}

/// One `Name=Value` line of a unit, in fleet's JSON schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOption {
    pub section: String,
    pub name: String,
    pub value: String,
}

impl UnitOption {
    fn new(section: &str, name: &str, value: impl Into<String>) -> Self {
        Self {
            section: section.to_string(),
            name: name.to_string(),
            value: value.into(),
        }
    }
}

/// A compiled unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFile {
    /// Unit name including the `.service` suffix.
    pub name: String,
    pub options: Vec<UnitOption>,
}

impl UnitFile {
    /// All values of `section`/`name`, in order.
    pub fn values<'a>(&'a self, section: &'a str, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.options
            .iter()
            .filter(move |o| o.section == section && o.name == name)
            .map(|o| o.value.as_str())
    }

    /// First value of `section`/`name`.
    pub fn value(&self, section: &str, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|o| o.section == section && o.name == name)
            .map(|o| o.value.as_str())
    }

    /// Spec hash recorded at compile time.
    pub fn spec_hash(&self) -> Option<SpecHash> {
        spec_hash_of(&self.options)
    }

    /// systemd text form.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut section: Option<&str> = None;

        for option in &self.options {
            if section != Some(option.section.as_str()) {
                if section.is_some() {
                    out.push('\n');
                }
                let _ = writeln!(out, "[{}]", option.section);
                section = Some(option.section.as_str());
            }
            let _ = writeln!(out, "{}={}", option.name, option.value);
        }

        out
    }
}

/// Reads the recorded spec hash out of a unit's options.
pub(crate) fn spec_hash_of(options: &[UnitOption]) -> Option<SpecHash> {
    options
        .iter()
        .find(|o| o.section == HASH_SECTION && o.name == HASH_OPTION)
        .and_then(|o| o.value.parse().ok())
}

/// The fleet unit name of a job.
pub fn unit_name(name: &JobName) -> String {
    format!("{name}{UNIT_SUFFIX}")
}

/// The job a fleet unit belongs to, if it is one of ours.
pub fn job_name(unit_name: &str) -> Option<JobName> {
    unit_name
        .strip_suffix(UNIT_SUFFIX)
        .and_then(|name| JobName::parse(name).ok())
}

/// Parameters shared by every compiled unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitTemplate {
    /// Value of the `role` machine metadata units are restricted to.
    pub worker_role: String,
    pub start_timeout: Duration,
}

impl Default for UnitTemplate {
    fn default() -> Self {
        Self {
            worker_role: DEFAULT_WORKER_ROLE.to_string(),
            start_timeout: DEFAULT_START_TIMEOUT,
        }
    }
}

impl UnitTemplate {
    pub fn new(worker_role: impl Into<String>) -> Self {
        Self {
            worker_role: worker_role.into(),
            ..Self::default()
        }
    }

    /// Compile one container into a unit.
    pub fn compile(&self, container: &Container) -> Result<UnitFile, CompileError> {
        self.validate(container)?;

        let name = container.name.to_string();
        let image = container.image.to_string();

        let mut run = format!("{DOCKER} run --name {name}");
        for (key, value) in &container.env {
            let _ = write!(run, " --env {}", quote(&format!("{key}={value}")));
        }
        let _ = write!(run, " --rm -h %H -P {}", escape(&image));
        if !container.command.trim().is_empty() {
            let _ = write!(run, " {}", escape(container.command.trim()));
        }

        let options = vec![
            UnitOption::new("Unit", "Description", name.clone()),
            UnitOption::new("Unit", "After", "docker.service"),
            UnitOption::new(
                "Service",
                "TimeoutStartSec",
                format!("{}s", self.start_timeout.as_secs()),
            ),
            UnitOption::new("Service", "Restart", "on-failure"),
            UnitOption::new(
                "Service",
                "ExecStartPre",
                format!("-{DOCKER} pull {}", escape(&image)),
            ),
            UnitOption::new("Service", "ExecStartPre", format!("-{DOCKER} rm -f {name}")),
            UnitOption::new("Service", "ExecStart", run),
            UnitOption::new("Service", "ExecStop", format!("{DOCKER} stop {name}")),
            UnitOption::new(
                "X-Fleet",
                "MachineMetadata",
                format!("role={}", self.worker_role),
            ),
            UnitOption::new(HASH_SECTION, HASH_OPTION, container.spec_hash().to_string()),
        ];

        Ok(UnitFile {
            name: unit_name(&container.name),
            options,
        })
    }

    fn validate(&self, container: &Container) -> Result<(), CompileError> {
        if container.image.repo.is_empty() || container.image.tag.is_empty() {
            return Err(CompileError::EmptyImage(container.image.to_string()));
        }

        check_line("image", &container.image.to_string())?;
        check_line("command", &container.command)?;
        check_line("worker role", &self.worker_role)?;

        for (key, value) in &container.env {
            if !valid_env_key(key) {
                return Err(CompileError::InvalidEnvKey(key.clone()));
            }
            check_line(&format!("environment variable {key}"), value)?;
        }

        Ok(())
    }
}

fn check_line(field: &str, value: &str) -> Result<(), CompileError> {
    if value.contains(['\n', '\r', '\0']) {
        return Err(CompileError::ControlCharacter(field.to_string()));
    }
    Ok(())
}

fn valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Escapes systemd specifiers (`%`) and variable expansion (`$`).
fn escape(s: &str) -> String {
    s.replace('%', "%%").replace('$', "$$")
}

/// Escapes `s` as a single ExecStart argument, quoting it if needed.
fn quote(s: &str) -> String {
    let escaped = escape(s);
    if !s.contains(|c: char| c.is_whitespace() || c == '"' || c == '\'' || c == '\\') {
        return escaped;
    }

    let mut out = String::with_capacity(escaped.len() + 2);
    out.push('"');
    for c in escaped.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rstest::rstest;

    use super::*;
    use crate::release::Image;

    fn container(env: &[(&str, &str)]) -> Container {
        Container {
            name: JobName::parse("acme.web.1").unwrap(),
            image: Image::new("registry/acme", "v1"),
            command: "./bin/web".to_string(),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn exec_start(unit: &UnitFile) -> &str {
        unit.value("Service", "ExecStart").unwrap()
    }

    #[test]
    fn test_compile_example() {
        let unit = UnitTemplate::default()
            .compile(&container(&[("PORT", "8080")]))
            .unwrap();

        assert_eq!(unit.name, "acme.web.1.service");
        assert_eq!(unit.value("Unit", "Description"), Some("acme.web.1"));
        assert_eq!(
            exec_start(&unit),
            "/usr/bin/docker run --name acme.web.1 --env PORT=8080 --rm -h %H -P registry/acme:v1 ./bin/web"
        );
    }

    #[test]
    fn test_compile_restart_pre_steps_and_affinity() {
        let unit = UnitTemplate::new("workers")
            .compile(&container(&[]))
            .unwrap();

        assert_eq!(unit.value("Service", "Restart"), Some("on-failure"));
        let pre: Vec<&str> = unit.values("Service", "ExecStartPre").collect();
        assert_eq!(
            pre,
            vec![
                "-/usr/bin/docker pull registry/acme:v1",
                "-/usr/bin/docker rm -f acme.web.1",
            ]
        );
        assert_eq!(unit.value("X-Fleet", "MachineMetadata"), Some("role=workers"));
        assert_eq!(unit.value("Service", "TimeoutStartSec"), Some("1800s"));
    }

    #[test]
    fn test_env_sorted_by_key() {
        let unit = UnitTemplate::default()
            .compile(&container(&[("ZED", "1"), ("ALPHA", "2")]))
            .unwrap();
        let run = exec_start(&unit);
        let alpha = run.find("--env ALPHA=2").unwrap();
        let zed = run.find("--env ZED=1").unwrap();
        assert!(alpha < zed);
    }

    #[rstest]
    #[case::plain("8080", "--env V=8080 ")]
    #[case::percent("50%", "--env V=50%% ")]
    #[case::dollar("$HOME", "--env V=$$HOME ")]
    #[case::space("hello world", "--env \"V=hello world\" ")]
    #[case::quote("say \"hi\"", "--env \"V=say \\\"hi\\\"\" ")]
    fn test_env_escaping(#[case] value: &str, #[case] expected: &str) {
        let unit = UnitTemplate::default()
            .compile(&container(&[("V", value)]))
            .unwrap();
        assert!(
            exec_start(&unit).contains(expected),
            "{} does not contain {expected}",
            exec_start(&unit)
        );
    }

    #[rstest]
    #[case::leading_digit("1PORT")]
    #[case::dash("MY-VAR")]
    #[case::empty("")]
    fn test_invalid_env_key(#[case] key: &str) {
        let err = UnitTemplate::default()
            .compile(&container(&[(key, "x")]))
            .unwrap_err();
        assert_eq!(err, CompileError::InvalidEnvKey(key.to_string()));
    }

    #[test]
    fn test_newline_rejected() {
        let mut c = container(&[("A", "line\nbreak")]);
        assert!(matches!(
            UnitTemplate::default().compile(&c),
            Err(CompileError::ControlCharacter(_))
        ));

        c.env.clear();
        c.command = "./bin/web\0".to_string();
        assert_eq!(
            UnitTemplate::default().compile(&c).unwrap_err(),
            CompileError::ControlCharacter("command".to_string())
        );
    }

    #[test]
    fn test_empty_image_rejected() {
        let mut c = container(&[]);
        c.image.tag = String::new();
        assert!(matches!(
            UnitTemplate::default().compile(&c),
            Err(CompileError::EmptyImage(_))
        ));
    }

    #[test]
    fn test_spec_hash_recorded() {
        let c = container(&[("PORT", "8080")]);
        let unit = UnitTemplate::default().compile(&c).unwrap();
        assert_eq!(unit.spec_hash(), Some(c.spec_hash()));
    }

    #[test]
    fn test_render() {
        let unit = UnitTemplate::default().compile(&container(&[])).unwrap();
        let text = unit.render();

        assert!(text.starts_with("[Unit]\nDescription=acme.web.1\nAfter=docker.service\n\n[Service]\n"));
        assert!(text.contains("\n\n[X-Fleet]\nMachineMetadata=role=flotilla_minion\n"));
        assert!(text.contains("[X-Flotilla]\nSpecHash=sha256:"));
    }

    #[test]
    fn test_job_name_round_trip() {
        let name = JobName::parse("acme.web.3").unwrap();
        assert_eq!(job_name(&unit_name(&name)), Some(name));
        assert_eq!(job_name("etcd.service"), None);
        assert_eq!(job_name("acme.web.3.timer"), None);
    }
}
