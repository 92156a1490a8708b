//! Pre-execution policy screener.
//!
//! A coarse, language-aware deny list matched as plain regular expressions
//! against the raw source. This is a *policy* gate, not a sandbox — it
//! rejects obviously hostile submissions early with a named reason, and must
//! never be relied on for containment.
//!
//! Pattern tables are compiled once at startup; after that the screener is a
//! pure function of `(language, code)`, with verdicts memoized for five
//! minutes keyed by a digest of the pair.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};
use std::time::{Duration, Instant};

use kiln_model::{LanguageId, Verdict};
use regex::Regex;
use sha2::{Digest, Sha256};

/// How long a memoized verdict stays valid.
const MEMO_TTL: Duration = Duration::from_secs(300);

/// Bound on the memo map; oldest entries are evicted past this.
const MEMO_MAX_ENTRIES: usize = 4096;

/// A named deny pattern.
struct Pattern {
    name: &'static str,
    regex: Regex,
}

fn compile(table: &[(&'static str, &'static str)]) -> Vec<Pattern> {
    table
        .iter()
        .map(|(name, re)| Pattern {
            name,
            regex: Regex::new(re).expect("static policy regex is valid"),
        })
        .collect()
}

/// Patterns applied to every language.
static AGNOSTIC: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    compile(&[
        ("shell-substitution", r"\$\([^)]*\)"),
        ("backtick-exec", r"`[^`]+`"),
        (
            "system-file-access",
            r"/etc/(?:passwd|shadow|sudoers)|/proc/self|/dev/(?:mem|kmem)|\.ssh/id_",
        ),
        ("path-traversal", r"\.\./\.\./"),
    ])
});

static PYTHON: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    compile(&[
        (
            "python-process-creation",
            r"os\.(?:system|popen|exec\w*|spawn\w*|fork)",
        ),
        ("python-subprocess", r"\bsubprocess\b"),
        ("python-eval-exec", r"\beval\s*\(|\bexec\s*\(|\bcompile\s*\("),
        ("python-import-hook", r"__import__\s*\(|\bimportlib\b"),
        ("python-native-ffi", r"\bctypes\b|\bcffi\b"),
        ("python-raw-socket", r"import\s+socket"),
    ])
});

static NODE: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    compile(&[
        ("node-child-process", r"child_process|execSync|spawnSync"),
        (
            "node-fs-escape",
            r#"require\s*\(\s*['"](?:fs|vm)['"]|from\s+['"](?:fs|vm)['"]"#,
        ),
        (
            "node-process-access",
            r"process\.(?:env|exit|binding|kill)",
        ),
        ("node-eval", r"\beval\s*\(|new\s+Function\s*\("),
    ])
});

static SCRIPT: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    compile(&[
        (
            "script-process-creation",
            r"\bsystem\s*\(|\bexec\s*\(|\bpopen\b|proc_open|shell_exec|passthru",
        ),
        ("script-eval", r"\beval\s*\("),
        ("lua-os-execute", r"os\.execute|io\.popen"),
    ])
});

static JAVA: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    compile(&[
        (
            "java-process-creation",
            r"Runtime\s*\.\s*getRuntime\s*\(\s*\)|ProcessBuilder",
        ),
        (
            "java-reflective-redefinition",
            r"Class\.forName|setAccessible\s*\(\s*true",
        ),
    ])
});

static NATIVE: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    compile(&[
        (
            "native-process-creation",
            r"\bsystem\s*\(|\bexec[vl][pe]?\s*\(|\bexecve\s*\(|\bfork\s*\(|\bpopen\s*\(",
        ),
        ("native-raw-syscall", r"\bsyscall\s*\(|\bptrace\s*\("),
        ("apple-process-launch", r"\bNSTask\b|posix_spawn"),
    ])
});

static RUST: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    compile(&[
        (
            "rust-process-creation",
            r"std::process|Command::new",
        ),
        ("rust-raw-libc", r"\blibc::"),
    ])
});

static GO: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    compile(&[
        ("go-process-creation", r#""os/exec""#),
        ("go-raw-syscall", r#""syscall""#),
    ])
});

static CSHARP: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    compile(&[(
        "csharp-process-creation",
        r"Process\.Start|System\.Diagnostics\.Process",
    )])
});

fn family_patterns(language: LanguageId) -> &'static [Pattern] {
    match language {
        LanguageId::Python => &PYTHON,
        LanguageId::Javascript | LanguageId::Typescript => &NODE,
        LanguageId::Php | LanguageId::Perl | LanguageId::Ruby | LanguageId::Lua => &SCRIPT,
        LanguageId::Java => &JAVA,
        LanguageId::C | LanguageId::Cpp | LanguageId::Objc | LanguageId::Swift => &NATIVE,
        LanguageId::Rust => &RUST,
        LanguageId::Go => &GO,
        LanguageId::Csharp => &CSHARP,
    }
}

struct MemoEntry {
    verdict: Verdict,
    at: Instant,
}

/// The policy screener. Cheap to share behind an `Arc`.
pub struct PolicyScreener {
    memo: Mutex<HashMap<[u8; 32], MemoEntry>>,
}

impl Default for PolicyScreener {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyScreener {
    /// Create a screener with an empty memo.
    pub fn new() -> Self {
        Self {
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// Screen a `(language, code)` pair against the deny tables.
    ///
    /// First match loses; the verdict names the pattern. Verdicts are
    /// memoized for [`MEMO_TTL`].
    pub fn screen(&self, language: LanguageId, code: &str) -> Verdict {
        let key = digest(language, code);

        {
            let memo = self.memo.lock().expect("policy memo lock poisoned");
            if let Some(entry) = memo.get(&key) {
                if entry.at.elapsed() < MEMO_TTL {
                    return entry.verdict;
                }
            }
        }

        let verdict = self.evaluate(language, code);

        let mut memo = self.memo.lock().expect("policy memo lock poisoned");
        if memo.len() >= MEMO_MAX_ENTRIES {
            memo.retain(|_, e| e.at.elapsed() < MEMO_TTL);
            if memo.len() >= MEMO_MAX_ENTRIES {
                // Still full of live entries: drop the oldest.
                if let Some(oldest) = memo
                    .iter()
                    .min_by_key(|(_, e)| e.at)
                    .map(|(k, _)| *k)
                {
                    memo.remove(&oldest);
                }
            }
        }
        memo.insert(
            key,
            MemoEntry {
                verdict,
                at: Instant::now(),
            },
        );
        verdict
    }

    fn evaluate(&self, language: LanguageId, code: &str) -> Verdict {
        for pattern in AGNOSTIC.iter().chain(family_patterns(language)) {
            if pattern.regex.is_match(code) {
                tracing::debug!(
                    language = %language,
                    pattern = pattern.name,
                    "policy screener rejected submission"
                );
                return Verdict::rejected(pattern.name);
            }
        }
        Verdict::ok()
    }

    /// Number of memoized verdicts (for health reporting).
    pub fn memo_len(&self) -> usize {
        self.memo.lock().expect("policy memo lock poisoned").len()
    }
}

fn digest(language: LanguageId, code: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(language.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(code.as_bytes());
    hasher.finalize().into()
}
