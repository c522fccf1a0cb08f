//! # Container Validator
//!
//! Integrity and structure checks for persisted `.nxc` containers:
//! archive shape (mimetype entry first), manifest parseability, the four
//! fixed bluesky sections, value/timestamp length parity per field, and
//! resolvability of every link in the tree.
//!
//! Validation problems are reported as checks, not errors; only I/O-level
//! failures reading the file surface as `Err`.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

#[cfg(feature = "colorized_output")]
use console::style;

use crate::container::{Container, ContainerError, Group, Node, NXC_MIMETYPE};

/// Validation check result status
#[derive(Debug, Clone)]
pub enum CheckStatus {
    /// Check passed
    Ok,
    /// Check passed with warnings
    Warning(String),
    /// Check failed
    Failed(String),
}

impl CheckStatus {
    fn is_ok(&self) -> bool {
        matches!(self, CheckStatus::Ok)
    }

    fn is_failed(&self) -> bool {
        matches!(self, CheckStatus::Failed(_))
    }
}

/// Individual validation check result
#[derive(Debug, Clone)]
pub struct ValidationCheck {
    /// Name of the validation check
    pub name: String,
    /// Result status of the check
    pub status: CheckStatus,
}

impl ValidationCheck {
    fn ok(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
        }
    }

    fn warning(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warning(message.into()),
        }
    }

    fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Failed(message.into()),
        }
    }
}

/// Complete validation report for a container file
#[derive(Debug)]
pub struct ValidationReport {
    /// List of individual validation check results
    pub checks: Vec<ValidationCheck>,
    /// Path of the file that was validated
    pub file_path: String,
}

impl ValidationReport {
    fn new(file_path: impl Into<String>) -> Self {
        Self {
            checks: Vec::new(),
            file_path: file_path.into(),
        }
    }

    fn add(&mut self, check: ValidationCheck) {
        self.checks.push(check);
    }

    /// Check if any validation checks failed
    pub fn has_failures(&self) -> bool {
        self.checks.iter().any(|c| c.status.is_failed())
    }

    /// Check if any validation checks produced warnings
    pub fn has_warnings(&self) -> bool {
        self.checks
            .iter()
            .any(|c| matches!(c.status, CheckStatus::Warning(_)))
    }

    /// Count the number of successful checks
    pub fn success_count(&self) -> usize {
        self.checks.iter().filter(|c| c.status.is_ok()).count()
    }

    /// Count the number of failures
    pub fn failure_count(&self) -> usize {
        self.checks.iter().filter(|c| c.status.is_failed()).count()
    }

    /// Format the report with colors (requires the console feature)
    pub fn format_colored(&self) -> String {
        #[cfg(feature = "colorized_output")]
        {
            use console::Emoji;

            static OK: Emoji<'static, 'static> = Emoji("✓", "[OK]");
            static WARN: Emoji<'static, 'static> = Emoji("⚠", "[WARN]");
            static FAIL: Emoji<'static, 'static> = Emoji("✗", "[FAIL]");

            let mut output = String::new();
            output.push_str(&format!("{}\n", style("nxsas Container Report").bold().cyan()));
            output.push_str(&format!("{}\n", style("======================").cyan()));
            output.push_str(&format!("{}: {}\n\n", style("File").bold(), self.file_path));

            for check in &self.checks {
                let symbol = match &check.status {
                    CheckStatus::Ok => OK,
                    CheckStatus::Warning(_) => WARN,
                    CheckStatus::Failed(_) => FAIL,
                };
                output.push_str(&format!("[{}] {}", symbol, check.name));
                match &check.status {
                    CheckStatus::Ok => output.push('\n'),
                    CheckStatus::Warning(msg) => {
                        output.push_str(&format!(" - {}: {}\n", style("WARNING").yellow().bold(), msg));
                    }
                    CheckStatus::Failed(msg) => {
                        output.push_str(&format!(" - {}: {}\n", style("FAILED").red().bold(), msg));
                    }
                }
            }
            output.push_str(&format!(
                "\n{} passed, {} failed\n",
                self.success_count(),
                self.failure_count()
            ));
            output
        }
        #[cfg(not(feature = "colorized_output"))]
        {
            self.to_string()
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "nxsas Container Report")?;
        writeln!(f, "======================")?;
        writeln!(f, "File: {}", self.file_path)?;
        writeln!(f)?;
        for check in &self.checks {
            match &check.status {
                CheckStatus::Ok => writeln!(f, "[OK]   {}", check.name)?,
                CheckStatus::Warning(msg) => writeln!(f, "[WARN] {} - {}", check.name, msg)?,
                CheckStatus::Failed(msg) => writeln!(f, "[FAIL] {} - {}", check.name, msg)?,
            }
        }
        writeln!(f)?;
        write!(f, "{} passed, {} failed", self.success_count(), self.failure_count())
    }
}

/// Validate a persisted container file
pub fn validate_container<P: AsRef<Path>>(path: P) -> Result<ValidationReport, ContainerError> {
    let path = path.as_ref();
    let mut report = ValidationReport::new(path.display().to_string());

    // Archive-level checks against the raw ZIP.
    let file = File::open(path)?;
    match zip::ZipArchive::new(file) {
        Err(e) => {
            report.add(ValidationCheck::failed("archive readable", e.to_string()));
            return Ok(report);
        }
        Ok(mut archive) => {
            report.add(ValidationCheck::ok("archive readable"));
            match archive.by_index(0) {
                Ok(mut first) if first.name() == "mimetype" => {
                    let mut content = String::new();
                    let _ = first.read_to_string(&mut content);
                    if content == NXC_MIMETYPE {
                        report.add(ValidationCheck::ok("mimetype entry"));
                    } else {
                        report.add(ValidationCheck::failed(
                            "mimetype entry",
                            format!("unexpected content '{content}'"),
                        ));
                    }
                }
                _ => {
                    report.add(ValidationCheck::failed(
                        "mimetype entry",
                        "first archive entry is not 'mimetype'",
                    ));
                }
            }
        }
    }

    let container = match Container::open(path) {
        Ok(container) => {
            report.add(ValidationCheck::ok("manifest parses"));
            container
        }
        Err(e) => {
            report.add(ValidationCheck::failed("manifest parses", e.to_string()));
            return Ok(report);
        }
    };

    // The four fixed raw-document sections.
    let missing: Vec<&str> = ["bluesky/start", "bluesky/descriptors", "bluesky/events", "bluesky/stop"]
        .into_iter()
        .filter(|section| !container.exists(section))
        .collect();
    if missing.is_empty() {
        report.add(ValidationCheck::ok("bluesky sections"));
    } else {
        report.add(ValidationCheck::failed(
            "bluesky sections",
            format!("missing: {missing:?}"),
        ));
    }

    report.add(check_timestamp_parity(&container));
    report.add(check_link_targets(&container));

    Ok(report)
}

/// Every `data/{field}` must have a `timestamps/{field}` of equal length
fn check_timestamp_parity(container: &Container) -> ValidationCheck {
    let name = "value/timestamp parity";
    let Some(Node::Group(events)) = container.node("bluesky/events") else {
        return ValidationCheck::warning(name, "no events section");
    };

    let mut problems = Vec::new();
    for (stream, node) in &events.children {
        let Node::Group(stream_group) = node else {
            continue;
        };
        let fields: Vec<String> = match stream_group.children.iter().find(|(n, _)| n == "data") {
            Some((_, Node::Group(data))) => data.children.iter().map(|(n, _)| n.clone()).collect(),
            _ => continue,
        };
        for field in fields {
            let data_path = format!("bluesky/events/{stream}/data/{field}");
            let ts_path = format!("bluesky/events/{stream}/timestamps/{field}");
            match (container.dataset(&data_path), container.dataset(&ts_path)) {
                (Ok(data), Ok(ts)) => {
                    if data.rows() != ts.rows() {
                        problems.push(format!(
                            "{stream}/{field}: {} values, {} timestamps",
                            data.rows(),
                            ts.rows()
                        ));
                    }
                }
                _ => problems.push(format!("{stream}/{field}: missing timestamps")),
            }
        }
    }

    if problems.is_empty() {
        ValidationCheck::ok(name)
    } else {
        ValidationCheck::failed(name, problems.join("; "))
    }
}

/// Every link in the tree must point at an existing node
fn check_link_targets(container: &Container) -> ValidationCheck {
    fn collect_links(group: &Group, prefix: &str, links: &mut Vec<(String, String)>) {
        for (name, node) in &group.children {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            match node {
                Node::Group(g) => collect_links(g, &path, links),
                Node::Link(l) => links.push((path, l.target.clone())),
                Node::Dataset(_) => {}
            }
        }
    }

    let mut links = Vec::new();
    collect_links(container.root(), "", &mut links);

    let dangling: Vec<String> = links
        .iter()
        .filter(|(_, target)| !container.exists(target))
        .map(|(path, target)| format!("{path} -> {target}"))
        .collect();

    let name = "link targets resolve";
    if dangling.is_empty() {
        ValidationCheck::ok(name)
    } else {
        ValidationCheck::failed(name, dangling.join("; "))
    }
}
