/// Runtime configuration, read from a `kestrel.ini` file.
///
/// Recognized sections and keys:
///   [basic]  version, script, path, timezone
///   [gc]     gcType, gcHeapSize, gcGrowthFactor, gcStressMode
///   [flags]  flagUnusedVariable, flagMutableVariable, flagUnusedImport
///            (0 = off, 1 = warn, 2 = error)
///   [debug]  debugToken, debugAst, debugSymtab, debugCode, debugGC
///
/// Unknown sections and keys are ignored so configurations stay forward
/// compatible. Every key has a default; a missing file yields the default
/// configuration.

use std::fmt;
use std::path::Path;

/// Severity of an optional analysis flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagLevel {
    None,
    Warn,
    Error,
}

impl FlagLevel {
    fn from_value(value: &str) -> FlagLevel {
        match value.trim() {
            "1" => FlagLevel::Warn,
            "2" => FlagLevel::Error,
            _ => FlagLevel::None,
        }
    }
}

impl fmt::Display for FlagLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagLevel::None => write!(f, "0"),
            FlagLevel::Warn => write!(f, "1"),
            FlagLevel::Error => write!(f, "2"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Configuration {
    // [basic]
    pub version: String,
    pub script: String,
    pub path: String,
    pub timezone: String,

    // [gc]
    pub gc_type: String,
    pub gc_heap_size: usize,
    pub gc_growth_factor: usize,
    pub gc_stress_mode: bool,

    // [flags]
    pub flag_unused_variable: FlagLevel,
    pub flag_mutable_variable: FlagLevel,
    pub flag_unused_import: FlagLevel,

    // [debug]
    pub debug_token: bool,
    pub debug_ast: bool,
    pub debug_symtab: bool,
    pub debug_code: bool,
    pub debug_gc: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            version: "0.1.0".into(),
            script: String::new(),
            path: ".".into(),
            timezone: "UTC".into(),
            gc_type: "generational".into(),
            gc_heap_size: 1024 * 1024,
            gc_growth_factor: 2,
            gc_stress_mode: false,
            flag_unused_variable: FlagLevel::None,
            flag_mutable_variable: FlagLevel::None,
            flag_unused_import: FlagLevel::None,
            debug_token: false,
            debug_ast: false,
            debug_symtab: false,
            debug_code: false,
            debug_gc: false,
        }
    }
}

impl Configuration {
    /// Loads the configuration file at `path`, falling back to defaults if
    /// the file does not exist.
    pub fn load(path: &Path) -> std::io::Result<Configuration> {
        if !path.exists() {
            return Ok(Configuration::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(Configuration::parse(&text))
    }

    /// Parses INI text. Lines are `key=value`, grouped under `[section]`
    /// headers; `;` and `#` begin comments.
    pub fn parse(text: &str) -> Configuration {
        let mut conf = Configuration::default();
        let mut section = String::new();

        for raw in text.lines() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                section = line[1..line.len() - 1].trim().to_lowercase();
                continue;
            }
            let Some(eq) = line.find('=') else { continue };
            let key = line[..eq].trim();
            let value = line[eq + 1..].trim();
            conf.apply(&section, key, value);
        }
        conf
    }

    fn apply(&mut self, section: &str, key: &str, value: &str) {
        match (section, key) {
            ("basic", "version") => self.version = value.into(),
            ("basic", "script") => self.script = value.into(),
            ("basic", "path") => self.path = value.into(),
            ("basic", "timezone") => self.timezone = value.into(),
            ("gc", "gcType") => self.gc_type = value.into(),
            ("gc", "gcHeapSize") => {
                if let Ok(n) = value.parse::<usize>() {
                    self.gc_heap_size = n;
                }
            }
            ("gc", "gcGrowthFactor") => {
                if let Ok(n) = value.parse::<usize>() {
                    self.gc_growth_factor = n.max(2);
                }
            }
            ("gc", "gcStressMode") => self.gc_stress_mode = parse_bool(value),
            ("flags", "flagUnusedVariable") => {
                self.flag_unused_variable = FlagLevel::from_value(value)
            }
            ("flags", "flagMutableVariable") => {
                self.flag_mutable_variable = FlagLevel::from_value(value)
            }
            ("flags", "flagUnusedImport") => {
                self.flag_unused_import = FlagLevel::from_value(value)
            }
            ("debug", "debugToken") => self.debug_token = parse_bool(value),
            ("debug", "debugAst") => self.debug_ast = parse_bool(value),
            ("debug", "debugSymtab") => self.debug_symtab = parse_bool(value),
            ("debug", "debugCode") => self.debug_code = parse_bool(value),
            ("debug", "debugGC") => self.debug_gc = parse_bool(value),
            _ => {}
        }
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find(|c| c == ';' || c == '#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim(), "true" | "1" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let conf = Configuration::default();
        assert_eq!(conf.gc_growth_factor, 2);
        assert!(!conf.gc_stress_mode);
        assert_eq!(conf.flag_unused_variable, FlagLevel::None);
    }

    #[test]
    fn test_parse_sections_and_keys() {
        let conf = Configuration::parse(
            "[basic]\n\
             version = 1.2.0\n\
             script = main.kes ; entry point\n\
             [gc]\n\
             gcHeapSize = 4096\n\
             gcStressMode = true\n\
             [flags]\n\
             flagUnusedVariable = 1\n\
             flagMutableVariable = 2\n\
             [debug]\n\
             debugCode = on\n",
        );
        assert_eq!(conf.version, "1.2.0");
        assert_eq!(conf.script, "main.kes");
        assert_eq!(conf.gc_heap_size, 4096);
        assert!(conf.gc_stress_mode);
        assert_eq!(conf.flag_unused_variable, FlagLevel::Warn);
        assert_eq!(conf.flag_mutable_variable, FlagLevel::Error);
        assert!(conf.debug_code);
        assert!(!conf.debug_ast);
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let conf = Configuration::parse("[basic]\nmystery = 42\n[weird]\nx = y\n");
        assert_eq!(conf.version, "0.1.0");
    }
}
