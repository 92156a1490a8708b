//! The static language registry.
//!
//! Fifteen supported languages, fixed at build time. Each entry carries the
//! display name, toolchain version label, source-file suffix, run recipe, and
//! default packages installed into the language's base workspace at startup.
//!
//! Recipes are templates over a single placeholder, `{file}`, which the
//! execution engine replaces with the absolute path of the temporary source
//! file. No other substitution happens at the template level. Shell recipes
//! may reference `$KILN_BUILD` (the language's build directory) and
//! `$KILN_MAIN` (the source file stem, used as Java's main class); both are
//! exported by the engine before the child runs, so they resolve through
//! ordinary shell expansion rather than templating.

use serde::{Deserialize, Serialize};

/// Identifier of a supported language. Matched case-sensitively: the wire
/// form is the lowercase token (`"python"`, `"objc"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanguageId {
    /// Python 3.
    Python,
    /// JavaScript on Node.
    Javascript,
    /// TypeScript via tsx.
    Typescript,
    /// Java.
    Java,
    /// C.
    C,
    /// C++.
    Cpp,
    /// C# on Mono.
    Csharp,
    /// Rust.
    Rust,
    /// Go.
    Go,
    /// PHP.
    Php,
    /// Perl.
    Perl,
    /// Ruby.
    Ruby,
    /// Lua.
    Lua,
    /// Swift.
    Swift,
    /// Objective-C.
    Objc,
}

impl LanguageId {
    /// All supported ids, in registry order.
    pub const ALL: [LanguageId; 15] = [
        LanguageId::Python,
        LanguageId::Javascript,
        LanguageId::Typescript,
        LanguageId::Java,
        LanguageId::C,
        LanguageId::Cpp,
        LanguageId::Csharp,
        LanguageId::Rust,
        LanguageId::Go,
        LanguageId::Php,
        LanguageId::Perl,
        LanguageId::Ruby,
        LanguageId::Lua,
        LanguageId::Swift,
        LanguageId::Objc,
    ];

    /// The lowercase wire token for this id.
    pub const fn as_str(self) -> &'static str {
        match self {
            LanguageId::Python => "python",
            LanguageId::Javascript => "javascript",
            LanguageId::Typescript => "typescript",
            LanguageId::Java => "java",
            LanguageId::C => "c",
            LanguageId::Cpp => "cpp",
            LanguageId::Csharp => "csharp",
            LanguageId::Rust => "rust",
            LanguageId::Go => "go",
            LanguageId::Php => "php",
            LanguageId::Perl => "perl",
            LanguageId::Ruby => "ruby",
            LanguageId::Lua => "lua",
            LanguageId::Swift => "swift",
            LanguageId::Objc => "objc",
        }
    }

    /// Resolve a wire token to an id. Case-sensitive: `"Python"` is unknown.
    pub fn parse(token: &str) -> Option<LanguageId> {
        LanguageId::ALL.iter().copied().find(|l| l.as_str() == token)
    }

    /// Whether this language builds an artifact before running it.
    pub const fn is_compiled(self) -> bool {
        matches!(
            self,
            LanguageId::C
                | LanguageId::Cpp
                | LanguageId::Rust
                | LanguageId::Swift
                | LanguageId::Csharp
                | LanguageId::Java
        )
    }
}

impl std::fmt::Display for LanguageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a language's source file is turned into a running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipe {
    /// A single program with fixed arguments; `{file}` names the source.
    Exec(&'static [&'static str]),
    /// A shell-joined compile-then-run pipeline, executed via `sh -c`.
    Shell(&'static str),
}

/// Immutable descriptor of one supported language.
#[derive(Debug, Clone, Copy)]
pub struct LanguageSpec {
    /// Registry id.
    pub id: LanguageId,
    /// Human-facing name.
    pub display_name: &'static str,
    /// Toolchain version label, informational only.
    pub toolchain_version: &'static str,
    /// Source-file suffix, including the dot.
    pub suffix: &'static str,
    /// Run recipe over `{file}`.
    pub recipe: Recipe,
    /// Packages installed into the base workspace at startup.
    pub default_packages: &'static [&'static str],
}

static REGISTRY: [LanguageSpec; 15] = [
    LanguageSpec {
        id: LanguageId::Python,
        display_name: "Python",
        toolchain_version: "3.11",
        suffix: ".py",
        recipe: Recipe::Exec(&["python3", "{file}"]),
        default_packages: &["numpy", "pandas", "requests"],
    },
    LanguageSpec {
        id: LanguageId::Javascript,
        display_name: "JavaScript",
        toolchain_version: "node-20",
        suffix: ".js",
        recipe: Recipe::Exec(&["node", "{file}"]),
        default_packages: &["lodash", "axios"],
    },
    LanguageSpec {
        id: LanguageId::Typescript,
        display_name: "TypeScript",
        toolchain_version: "5.4",
        suffix: ".ts",
        recipe: Recipe::Exec(&["tsx", "{file}"]),
        default_packages: &["typescript", "tsx"],
    },
    LanguageSpec {
        id: LanguageId::Java,
        display_name: "Java",
        toolchain_version: "17",
        suffix: ".java",
        recipe: Recipe::Shell(r#"javac -d "$KILN_BUILD" "{file}" && java -cp "$KILN_BUILD" "$KILN_MAIN""#),
        default_packages: &[],
    },
    LanguageSpec {
        id: LanguageId::C,
        display_name: "C",
        toolchain_version: "c17",
        suffix: ".c",
        recipe: Recipe::Shell(r#"cc -O2 "{file}" -o "$KILN_BUILD/prog" -lm && "$KILN_BUILD/prog""#),
        default_packages: &[],
    },
    LanguageSpec {
        id: LanguageId::Cpp,
        display_name: "C++",
        toolchain_version: "c++17",
        suffix: ".cpp",
        recipe: Recipe::Shell(
            r#"c++ -std=c++17 -O2 "{file}" -o "$KILN_BUILD/prog" && "$KILN_BUILD/prog""#,
        ),
        default_packages: &[],
    },
    LanguageSpec {
        id: LanguageId::Csharp,
        display_name: "C#",
        toolchain_version: "mono-6",
        suffix: ".cs",
        recipe: Recipe::Shell(
            r#"mcs -out:"$KILN_BUILD/prog.exe" "{file}" && mono "$KILN_BUILD/prog.exe""#,
        ),
        default_packages: &[],
    },
    LanguageSpec {
        id: LanguageId::Rust,
        display_name: "Rust",
        toolchain_version: "1.82",
        suffix: ".rs",
        recipe: Recipe::Shell(r#"rustc -O "{file}" -o "$KILN_BUILD/prog" && "$KILN_BUILD/prog""#),
        default_packages: &[],
    },
    LanguageSpec {
        id: LanguageId::Go,
        display_name: "Go",
        toolchain_version: "1.22",
        suffix: ".go",
        recipe: Recipe::Exec(&["go", "run", "{file}"]),
        default_packages: &[],
    },
    LanguageSpec {
        id: LanguageId::Php,
        display_name: "PHP",
        toolchain_version: "8.2",
        suffix: ".php",
        recipe: Recipe::Exec(&["php", "{file}"]),
        default_packages: &[],
    },
    LanguageSpec {
        id: LanguageId::Perl,
        display_name: "Perl",
        toolchain_version: "5.38",
        suffix: ".pl",
        recipe: Recipe::Exec(&["perl", "{file}"]),
        default_packages: &[],
    },
    LanguageSpec {
        id: LanguageId::Ruby,
        display_name: "Ruby",
        toolchain_version: "3.2",
        suffix: ".rb",
        recipe: Recipe::Exec(&["ruby", "{file}"]),
        default_packages: &[],
    },
    LanguageSpec {
        id: LanguageId::Lua,
        display_name: "Lua",
        toolchain_version: "5.4",
        suffix: ".lua",
        recipe: Recipe::Exec(&["lua", "{file}"]),
        default_packages: &[],
    },
    LanguageSpec {
        id: LanguageId::Swift,
        display_name: "Swift",
        toolchain_version: "5.9",
        suffix: ".swift",
        recipe: Recipe::Shell(r#"swiftc -O "{file}" -o "$KILN_BUILD/prog" && "$KILN_BUILD/prog""#),
        default_packages: &[],
    },
    LanguageSpec {
        id: LanguageId::Objc,
        display_name: "Objective-C",
        toolchain_version: "clang-17",
        suffix: ".m",
        recipe: Recipe::Shell(
            r#"clang "{file}" -o "$KILN_BUILD/prog" -lobjc && "$KILN_BUILD/prog""#,
        ),
        default_packages: &[],
    },
];

impl LanguageSpec {
    /// Look up the descriptor for an id. Total: every id has an entry.
    pub fn lookup(id: LanguageId) -> &'static LanguageSpec {
        // REGISTRY is ordered exactly as LanguageId::ALL
        &REGISTRY[id as usize]
    }

    /// Look up by wire token, case-sensitively.
    pub fn for_token(token: &str) -> Option<&'static LanguageSpec> {
        LanguageId::parse(token).map(LanguageSpec::lookup)
    }

    /// All descriptors in registry order.
    pub fn all() -> &'static [LanguageSpec] {
        &REGISTRY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_every_id_in_order() {
        assert_eq!(LanguageSpec::all().len(), LanguageId::ALL.len());
        for (i, id) in LanguageId::ALL.iter().enumerate() {
            assert_eq!(LanguageSpec::all()[i].id, *id, "registry order mismatch");
            assert_eq!(LanguageSpec::lookup(*id).id, *id);
        }
    }

    #[test]
    fn parse_is_case_sensitive() {
        assert_eq!(LanguageId::parse("python"), Some(LanguageId::Python));
        assert_eq!(LanguageId::parse("Python"), None);
        assert_eq!(LanguageId::parse("PYTHON"), None);
        assert_eq!(LanguageId::parse("pascal"), None);
    }

    #[test]
    fn wire_tokens_round_trip_through_serde() {
        for id in LanguageId::ALL {
            let json = serde_json::to_string(&id).unwrap();
            assert_eq!(json, format!("\"{}\"", id.as_str()));
            let back: LanguageId = serde_json::from_str(&json).unwrap();
            assert_eq!(back, id);
        }
    }

    #[test]
    fn compiled_set_is_exactly_the_six() {
        let compiled: Vec<_> = LanguageId::ALL
            .iter()
            .copied()
            .filter(|l| l.is_compiled())
            .collect();
        assert_eq!(
            compiled,
            vec![
                LanguageId::Java,
                LanguageId::C,
                LanguageId::Cpp,
                LanguageId::Csharp,
                LanguageId::Rust,
                LanguageId::Swift,
            ]
        );
    }

    #[test]
    fn every_recipe_mentions_the_file_placeholder() {
        for spec in LanguageSpec::all() {
            match spec.recipe {
                Recipe::Exec(argv) => {
                    assert!(
                        argv.iter().any(|a| a.contains("{file}")),
                        "{} exec recipe lacks {{file}}",
                        spec.id
                    );
                }
                Recipe::Shell(line) => {
                    assert!(
                        line.contains("{file}"),
                        "{} shell recipe lacks {{file}}",
                        spec.id
                    );
                }
            }
        }
    }

    #[test]
    fn compiled_recipes_build_under_the_build_dir() {
        for spec in LanguageSpec::all() {
            if spec.id.is_compiled() {
                let Recipe::Shell(line) = spec.recipe else {
                    panic!("{} should be a shell pipeline", spec.id);
                };
                assert!(
                    line.contains("$KILN_BUILD"),
                    "{} pipeline does not target the build dir",
                    spec.id
                );
            }
        }
    }

    #[test]
    fn suffixes_are_dotted_and_unique() {
        let mut seen = std::collections::HashSet::new();
        for spec in LanguageSpec::all() {
            assert!(spec.suffix.starts_with('.'), "{}", spec.id);
            assert!(seen.insert(spec.suffix), "duplicate suffix {}", spec.suffix);
        }
    }
}
