//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use iconrepo_core::{CommitMetadata, ConsistencyReport, IconDescriptor, TagUsage};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to encode output: {}", e),
    }
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print a single icon with its iconfiles
    pub fn print_icon(&self, icon: &IconDescriptor) {
        match self.format {
            OutputFormat::Human => {
                println!("Name:        {}", icon.name);
                println!("Modified by: {}", icon.modified_by);
                if !icon.tags.is_empty() {
                    let tags: Vec<&str> = icon.tags.iter().map(String::as_str).collect();
                    println!("Tags:        {}", tags.join(", "));
                }
                println!();
                println!("── Iconfiles ({}) ──", icon.iconfiles.len());
                for iconfile in &icon.iconfiles {
                    println!("{:<6} {}", iconfile.format, iconfile.size);
                }
            }
            OutputFormat::Json => print_json(icon),
            OutputFormat::Quiet => println!("{}", icon.name),
        }
    }

    /// Print a list of icons
    pub fn print_icons(&self, icons: &[IconDescriptor]) {
        match self.format {
            OutputFormat::Human => {
                if icons.is_empty() {
                    println!("No icons found.");
                    return;
                }
                for icon in icons {
                    let renditions: Vec<String> = icon
                        .iconfiles
                        .iter()
                        .map(|f| format!("{}@{}", f.format, f.size))
                        .collect();
                    println!(
                        "{} | {} | {}",
                        truncate(&icon.name, 30),
                        truncate(&renditions.join(" "), 40),
                        icon.modified_by
                    );
                }
                println!("\n{} icon(s)", icons.len());
            }
            OutputFormat::Json => print_json(icons),
            OutputFormat::Quiet => {
                for icon in icons {
                    println!("{}", icon.name);
                }
            }
        }
    }

    /// Print a list of tags
    pub fn print_tags(&self, tags: &[TagUsage]) {
        match self.format {
            OutputFormat::Human => {
                if tags.is_empty() {
                    println!("No tags found.");
                    return;
                }
                for usage in tags {
                    println!("{} ({})", usage.tag, usage.reference_count);
                }
                println!("\n{} tag(s)", tags.len());
            }
            OutputFormat::Json => print_json(tags),
            OutputFormat::Quiet => {
                for usage in tags {
                    println!("{}", usage.tag);
                }
            }
        }
    }

    /// Print one blobstore version
    pub fn print_version(&self, metadata: &CommitMetadata) {
        match self.format {
            OutputFormat::Human => {
                println!("Version:   {}", metadata.commit_id);
                println!(
                    "Author:    {} <{}>",
                    metadata.author_name, metadata.author_email
                );
                println!(
                    "Date:      {}",
                    metadata.authored_at.format("%Y-%m-%d %H:%M")
                );
                println!();
                println!("{}", metadata.message.trim_end());
            }
            OutputFormat::Json => print_json(metadata),
            OutputFormat::Quiet => println!("{}", metadata.commit_id),
        }
    }

    /// Print the result of a consistency check
    pub fn print_report(&self, report: &ConsistencyReport) {
        match self.format {
            OutputFormat::Human => {
                if report.is_consistent() {
                    println!("✓ Index and blobstore agree");
                    return;
                }
                for path in &report.missing_content {
                    println!("missing   {}", path);
                }
                for path in &report.orphaned_content {
                    println!("orphaned  {}", path);
                }
                println!(
                    "\n{} missing, {} orphaned",
                    report.missing_content.len(),
                    report.orphaned_content.len()
                );
            }
            OutputFormat::Json => print_json(report),
            OutputFormat::Quiet => {
                for path in report
                    .missing_content
                    .iter()
                    .chain(&report.orphaned_content)
                {
                    println!("{}", path);
                }
            }
        }
    }

    /// Print any serializable value (JSON) or a short line
    pub fn print_value<T: Serialize>(&self, value: &T, human: &str) {
        match self.format {
            OutputFormat::Human | OutputFormat::Quiet => println!("{}", human),
            OutputFormat::Json => print_json(value),
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Check if we should prompt for confirmation
    pub fn should_prompt(&self) -> bool {
        self.format == OutputFormat::Human
    }
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("ääääääääääää", 5), "ää...");
    }

    #[test]
    fn test_only_human_output_prompts() {
        assert!(Output::new(OutputFormat::Human).should_prompt());
        assert!(!Output::new(OutputFormat::Json).should_prompt());
        assert!(!Output::new(OutputFormat::Quiet).should_prompt());
    }
}
