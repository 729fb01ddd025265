//! Interpreter selection per host platform

/// Host platform families that pick different default shells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Darwin,
    Unix,
}

impl Platform {
    /// Platform the agent was built for
    pub fn current() -> Self {
        Self::from_os(std::env::consts::OS)
    }

    /// Map an OS identifier; anything unrecognized is treated as Unix
    pub fn from_os(os: &str) -> Self {
        match os.to_ascii_lowercase().as_str() {
            "windows" => Platform::Windows,
            "darwin" | "macos" => Platform::Darwin,
            _ => Platform::Unix,
        }
    }

    /// Default interpreter for this platform
    pub fn default_interpreter(self) -> &'static str {
        match self {
            Platform::Windows => "powershell",
            Platform::Darwin => "/bin/zsh",
            Platform::Unix => "/bin/bash",
        }
    }
}

/// The interpreter chosen for one command run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    pub program: String,
    /// Whether the message named the interpreter explicitly
    pub overridden: bool,
}

impl Interpreter {
    /// True for any PowerShell host (`powershell`, `powershell.exe`, full paths)
    pub fn is_powershell(&self) -> bool {
        self.program.to_ascii_lowercase().contains("powershell")
    }
}

/// Resolve the interpreter: a non-empty override always wins
pub fn resolve(platform: Platform, override_: Option<&str>) -> Interpreter {
    match override_.map(str::trim).filter(|s| !s.is_empty()) {
        Some(program) => Interpreter {
            program: program.to_string(),
            overridden: true,
        },
        None => Interpreter {
            program: platform.default_interpreter().to_string(),
            overridden: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_defaults() {
        assert_eq!(resolve(Platform::Windows, None).program, "powershell");
        assert_eq!(resolve(Platform::Darwin, None).program, "/bin/zsh");
        assert_eq!(resolve(Platform::Unix, None).program, "/bin/bash");
    }

    #[test]
    fn test_override_wins_on_every_platform() {
        for platform in [Platform::Windows, Platform::Darwin, Platform::Unix] {
            let interpreter = resolve(platform, Some("/usr/bin/python3"));
            assert_eq!(interpreter.program, "/usr/bin/python3");
            assert!(interpreter.overridden);
        }
    }

    #[test]
    fn test_empty_override_falls_back() {
        let interpreter = resolve(Platform::Unix, Some(""));
        assert_eq!(interpreter.program, "/bin/bash");
        assert!(!interpreter.overridden);
    }

    #[test]
    fn test_unrecognized_os_is_unix() {
        assert_eq!(Platform::from_os("linux"), Platform::Unix);
        assert_eq!(Platform::from_os("freebsd"), Platform::Unix);
        assert_eq!(Platform::from_os("Windows"), Platform::Windows);
        assert_eq!(Platform::from_os("macos"), Platform::Darwin);
    }

    #[test]
    fn test_resolution_is_stable() {
        let first = resolve(Platform::Darwin, Some("pwsh"));
        for _ in 0..10 {
            assert_eq!(resolve(Platform::Darwin, Some("pwsh")), first);
        }
    }

    #[test]
    fn test_powershell_detection() {
        assert!(resolve(Platform::Windows, None).is_powershell());
        assert!(resolve(Platform::Unix, Some("C:\\Windows\\PowerShell.exe")).is_powershell());
        assert!(!resolve(Platform::Unix, None).is_powershell());
    }
}
