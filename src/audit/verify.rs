//! Audit Log Verification
//!
//! Replays the secret chain over a log file from secret_0. Verification is
//! strictly sequential: each line's secret is the one-way hash of the
//! secret that verified the line before it.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::audit::entry::{HeaderLine, TaggedLine};
use crate::crypto::{ChainSecret, Challenge, RootSecret};
use crate::error::SentinelError;

/// Additional rotations tried before a line is declared unverifiable.
pub const DEFAULT_MAX_ELISION: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationWarning {
    /// Entries between these two lines were signed but are missing.
    ElidedEntries { from_line: usize, to_line: usize },
    /// A line carries a tag made with the previous secret but differs from
    /// the previously accepted entry.
    TagReuse { line: usize },
}

impl std::fmt::Display for VerificationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationWarning::ElidedEntries { from_line, to_line } => write!(
                f,
                "entry appears to have been elided between lines {} and {}",
                from_line, to_line
            ),
            VerificationWarning::TagReuse { line } => write!(
                f,
                "re-used hash chain value for non-matching entries at line {}",
                line
            ),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    pub entries: usize,
    pub duplicates: usize,
    pub last_serial: Option<i64>,
    pub warnings: Vec<VerificationWarning>,
}

struct ChainState {
    cur: ChainSecret,
    prev: Option<ChainSecret>,
    prev_tag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChainVerifier {
    max_elision: usize,
}

impl Default for ChainVerifier {
    fn default() -> Self {
        Self {
            max_elision: DEFAULT_MAX_ELISION,
        }
    }
}

impl ChainVerifier {
    pub fn new(max_elision: usize) -> Self {
        Self { max_elision }
    }

    pub fn max_elision(&self) -> usize {
        self.max_elision
    }

    pub fn verify_file<F>(&self, path: &Path, seed: F) -> Result<VerificationReport, SentinelError>
    where
        F: FnOnce(&Challenge) -> Result<ChainSecret, SentinelError>,
    {
        let file = File::open(path)?;
        self.verify(BufReader::new(file), seed)
    }

    /// Verify a whole log. `seed` maps the header challenge to secret_0.
    pub fn verify<R, F>(&self, reader: R, seed: F) -> Result<VerificationReport, SentinelError>
    where
        R: BufRead,
        F: FnOnce(&Challenge) -> Result<ChainSecret, SentinelError>,
    {
        let mut lines = reader.lines().enumerate();
        let header = match lines.next() {
            Some((_, line)) => line?,
            None => {
                return Err(SentinelError::MalformedLogLine {
                    line: 1,
                    reason: "log is empty".to_string(),
                })
            }
        };
        let challenge = HeaderLine::parse(header.trim_end())?;

        let mut state = ChainState {
            cur: seed(&challenge)?,
            prev: None,
            prev_tag: None,
        };
        let mut report = VerificationReport::default();

        for (index, line) in lines {
            let lineno = index + 1;
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let tagged = TaggedLine::parse(&line, lineno)?;
            self.verify_line(&mut state, &tagged, lineno, &mut report)?;
        }

        info!(
            "Audit log verification successful: {} entries, {} warnings",
            report.entries,
            report.warnings.len()
        );
        Ok(report)
    }

    fn verify_line(
        &self,
        state: &mut ChainState,
        tagged: &TaggedLine,
        lineno: usize,
        report: &mut VerificationReport,
    ) -> Result<(), SentinelError> {
        let mut computed = state.cur.tag(&tagged.canonical);
        let mut valid = computed == tagged.tag;

        if !valid {
            if let Some(prev) = &state.prev {
                if prev.tag(&tagged.canonical) == tagged.tag {
                    if state.prev_tag.as_deref() == Some(tagged.tag.as_str()) {
                        debug!("Line {} repeats the previous entry", lineno);
                        report.duplicates += 1;
                    } else {
                        let warning = VerificationWarning::TagReuse { line: lineno };
                        warn!("{}", warning);
                        report.warnings.push(warning);
                    }
                    return Ok(());
                }
            }
        }

        state.prev = Some(state.cur.clone());
        state.cur = state.cur.next();
        let mut step = 1;

        while step < 1 + self.max_elision && !valid {
            computed = state.cur.tag(&tagged.canonical);
            valid = computed == tagged.tag;
            state.prev = Some(state.cur.clone());
            state.cur = state.cur.next();
            step += 1;
        }

        if !valid {
            return Err(SentinelError::ChainVerificationMismatch {
                line: lineno,
                included: tagged.tag.clone(),
                computed,
                step,
            });
        }

        if step > 1 {
            let warning = VerificationWarning::ElidedEntries {
                from_line: lineno - 1,
                to_line: lineno,
            };
            warn!("{}", warning);
            report.warnings.push(warning);
        }

        state.prev_tag = Some(tagged.tag.clone());
        report.entries += 1;
        if tagged.changenumber.is_some() {
            report.last_serial = tagged.changenumber;
        }
        Ok(())
    }

    /// Check a reconstructed root against the first tagged line of a log.
    /// Reconstruction from too few shares yields a plausible but wrong
    /// root; this is how callers find out.
    pub fn validate_root(
        &self,
        root: &RootSecret,
        challenge: &Challenge,
        first_entry_line: &str,
    ) -> Result<bool, SentinelError> {
        let tagged = TaggedLine::parse(first_entry_line, 2)?;
        let mut secret = root.derive_initial(challenge);
        for _ in 0..=self.max_elision {
            if secret.tag(&tagged.canonical) == tagged.tag {
                return Ok(true);
            }
            secret = secret.next();
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::{ChangeEntry, ChangeType};
    use serde_json::json;

    fn entry(n: i64) -> ChangeEntry {
        ChangeEntry {
            changenumber: n,
            changetime: "2016-03-01T10:00:00.000Z".to_string(),
            changetype: ChangeType::Delete,
            targetdn: format!("fingerprint=f{}, uuid=u1, ou=users, o=smartdc", n),
            changes: json!({"objectclass": ["sdckey"]}),
            entry: None,
        }
    }

    /// Sign `serials` in order; returns the lines, header first.
    fn build_log(secret_0: &ChainSecret, challenge: &Challenge, serials: &[i64]) -> Vec<String> {
        let mut lines = vec![HeaderLine::new(challenge).to_line().unwrap()];
        let mut secret = secret_0.clone();
        for n in serials {
            let e = entry(*n);
            lines.push(e.signed_line(&secret.tag(&e.canonical_bytes().unwrap())).unwrap());
            secret = secret.next();
        }
        lines
    }

    fn run(verifier: &ChainVerifier, lines: &[String], secret_0: &ChainSecret) -> Result<VerificationReport, SentinelError> {
        let text = lines.join("\n") + "\n";
        let seed = secret_0.clone();
        verifier.verify(text.as_bytes(), move |_| Ok(seed))
    }

    #[test]
    fn test_clean_log_verifies() {
        let root = RootSecret::generate();
        let challenge = Challenge::generate();
        let secret_0 = root.derive_initial(&challenge);
        let lines = build_log(&secret_0, &challenge, &[1, 2, 3]);

        let report = run(&ChainVerifier::default(), &lines, &secret_0).unwrap();
        assert_eq!(report.entries, 3);
        assert_eq!(report.last_serial, Some(3));
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_duplicate_line_is_skipped() {
        let challenge = Challenge::generate();
        let secret_0 = RootSecret::generate().derive_initial(&challenge);
        let mut lines = build_log(&secret_0, &challenge, &[1, 2]);
        lines.insert(3, lines[2].clone());

        let report = run(&ChainVerifier::default(), &lines, &secret_0).unwrap();
        assert_eq!(report.entries, 2);
        assert_eq!(report.duplicates, 1);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_tag_reuse_is_a_warning() {
        let challenge = Challenge::generate();
        let secret_0 = RootSecret::generate().derive_initial(&challenge);
        let mut lines = build_log(&secret_0, &challenge, &[1]);

        // A second, different entry tagged with the same secret.
        let other = entry(2);
        lines.push(other.signed_line(&secret_0.tag(&other.canonical_bytes().unwrap())).unwrap());

        let report = run(&ChainVerifier::default(), &lines, &secret_0).unwrap();
        assert_eq!(report.warnings, vec![VerificationWarning::TagReuse { line: 3 }]);
    }

    #[test]
    fn test_elision_bound_is_configurable() {
        let challenge = Challenge::generate();
        let secret_0 = RootSecret::generate().derive_initial(&challenge);
        let mut lines = build_log(&secret_0, &challenge, &[1, 2, 3, 4, 5]);
        lines.remove(3);
        lines.remove(3);

        let report = run(&ChainVerifier::default(), &lines, &secret_0).unwrap();
        assert_eq!(
            report.warnings,
            vec![VerificationWarning::ElidedEntries { from_line: 3, to_line: 4 }]
        );

        let strict = ChainVerifier::new(1);
        assert!(matches!(
            run(&strict, &lines, &secret_0),
            Err(SentinelError::ChainVerificationMismatch { line: 4, step: 2, .. })
        ));
    }

    #[test]
    fn test_wrong_seed_fails_on_first_entry() {
        let challenge = Challenge::generate();
        let secret_0 = RootSecret::generate().derive_initial(&challenge);
        let lines = build_log(&secret_0, &challenge, &[1]);
        let wrong = RootSecret::generate().derive_initial(&challenge);

        assert!(matches!(
            run(&ChainVerifier::default(), &lines, &wrong),
            Err(SentinelError::ChainVerificationMismatch { line: 2, step: 5, .. })
        ));
    }

    #[test]
    fn test_validate_root() {
        let root = RootSecret::generate();
        let challenge = Challenge::generate();
        let lines = build_log(&root.derive_initial(&challenge), &challenge, &[1]);

        let verifier = ChainVerifier::default();
        assert!(verifier.validate_root(&root, &challenge, &lines[1]).unwrap());
        assert!(!verifier
            .validate_root(&RootSecret::generate(), &challenge, &lines[1])
            .unwrap());
    }

    #[test]
    fn test_empty_log_is_malformed() {
        let verifier = ChainVerifier::default();
        let result = verifier.verify("".as_bytes(), |_| Err(SentinelError::NotInitialized));
        assert!(matches!(result, Err(SentinelError::MalformedLogLine { line: 1, .. })));
    }
}
