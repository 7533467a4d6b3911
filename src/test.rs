//! Test identity, batches, shards and results.
//!
//! These are the values that flow through the execution engine. A [`Test`]
//! is identified by its `(package, class, method)` triple; everything else it
//! carries is metadata and does not take part in equality or hashing.
//!
//! ```
//! use fleet::test::Test;
//!
//! let test = Test::parse("com.example.LoginTest#validPassword").unwrap();
//! assert_eq!(test.package, "com.example");
//! assert_eq!(test.class, "LoginTest");
//! assert_eq!(test.method, "validPassword");
//! assert_eq!(test.name(), "com.example.LoginTest#validPassword");
//! ```

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Metadata names that mark a test as ignored.
const IGNORE_MARKERS: &[&str] = &["org.junit.Ignore", "Ignore", "ignore"];

/// A named metadata property attached to a test (an annotation, a tag).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaProperty {
    pub name: String,
    #[serde(default)]
    pub values: HashMap<String, String>,
}

impl MetaProperty {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: HashMap::new(),
        }
    }
}

/// A single test case.
///
/// Equality and hashing only consider `package`, `class` and `method`, so two
/// values describing the same test with different metadata are the same test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Test {
    /// Package or namespace (may be empty).
    pub package: String,

    /// Class or suite name.
    pub class: String,

    /// Method or case name.
    pub method: String,

    /// Annotations and other metadata.
    #[serde(default)]
    pub metadata: Vec<MetaProperty>,
}

impl Test {
    /// Creates a test without metadata.
    pub fn new(
        package: impl Into<String>,
        class: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            package: package.into(),
            class: class.into(),
            method: method.into(),
            metadata: Vec::new(),
        }
    }

    /// Adds a metadata property.
    pub fn with_meta(mut self, property: MetaProperty) -> Self {
        self.metadata.push(property);
        self
    }

    /// Parses a canonical test name of the form `package.Class#method`.
    ///
    /// The package is everything before the last `.` of the class part and
    /// may be empty. Returns `None` when there is no `#` separator or one of
    /// the class and method parts is empty.
    pub fn parse(name: &str) -> Option<Self> {
        let (qualified, method) = name.trim().split_once('#')?;
        let (package, class) = match qualified.rsplit_once('.') {
            Some((package, class)) => (package, class),
            None => ("", qualified),
        };
        if class.is_empty() || method.is_empty() {
            return None;
        }
        Some(Self::new(package, class, method))
    }

    /// Returns the canonical name, `package.Class#method`.
    pub fn name(&self) -> String {
        if self.package.is_empty() {
            format!("{}#{}", self.class, self.method)
        } else {
            format!("{}.{}#{}", self.package, self.class, self.method)
        }
    }

    /// Returns `true` if the test carries an ignore marker.
    pub fn is_ignored(&self) -> bool {
        self.metadata
            .iter()
            .any(|m| IGNORE_MARKERS.contains(&m.name.as_str()))
    }
}

impl PartialEq for Test {
    fn eq(&self, other: &Self) -> bool {
        self.package == other.package && self.class == other.class && self.method == other.method
    }
}

impl Eq for Test {}

impl Hash for Test {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.package.hash(state);
        self.class.hash(state);
        self.method.hash(state);
    }
}

impl fmt::Display for Test {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Identifier of a dispatched batch, unique within one pool's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A group of distinct tests handed to one device in one execution call.
#[derive(Debug, Clone)]
pub struct TestBatch {
    pub id: BatchId,
    pub tests: Vec<Test>,

    /// Sum of the tests' median historical durations.
    pub expected_duration: Duration,

    /// Sum of the tests' 90th percentile historical durations.
    pub max_duration: Duration,
}

impl TestBatch {
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn contains(&self, test: &Test) -> bool {
        self.tests.contains(test)
    }
}

/// The tests assigned to one pool.
///
/// `flaky_tests` holds extra copies of tests from `tests`; each copy is one
/// more preemptive run of that test.
#[derive(Debug, Clone, Default)]
pub struct TestShard {
    pub tests: Vec<Test>,
    pub flaky_tests: Vec<Test>,
}

impl TestShard {
    pub fn new(tests: Vec<Test>) -> Self {
        Self {
            tests,
            flaky_tests: Vec::new(),
        }
    }

    /// Number of flaky copies queued for `test`.
    pub fn flaky_count(&self, test: &Test) -> usize {
        self.flaky_tests.iter().filter(|t| *t == test).count()
    }

    /// Total number of runs the shard asks for.
    pub fn len(&self) -> usize {
        self.tests.len() + self.flaky_tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty() && self.flaky_tests.is_empty()
    }
}

/// Outcome of one test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed,
    Ignored,
    /// The device finished the batch without reporting this test.
    Incomplete,
}

impl TestOutcome {
    /// Returns `true` for outcomes that finish a test (no retry needed).
    pub fn is_finished(&self) -> bool {
        matches!(self, TestOutcome::Passed | TestOutcome::Ignored)
    }
}

/// Result of one execution of one test on one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub test: Test,
    pub outcome: TestOutcome,
    pub device_serial: String,
    pub duration: Duration,
    pub message: Option<String>,
}

impl TestResult {
    pub fn new(test: Test, outcome: TestOutcome, device_serial: impl Into<String>) -> Self {
        Self {
            test,
            outcome,
            device_serial: device_serial.into(),
            duration: Duration::ZERO,
            message: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// An entry of a JSON test list: a canonical name or a full test object.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListEntry {
    Name(String),
    Test(Test),
}

/// Loads the list of tests to run.
///
/// Files ending in `.json` hold an array whose entries are canonical names
/// or test objects with metadata. Any other file holds one canonical name per
/// line; blank lines and lines starting with `#` are skipped.
pub fn load_tests(path: &Path) -> Result<Vec<Test>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read test list: {}", path.display()))?;

    if path.extension().is_some_and(|ext| ext == "json") {
        let entries: Vec<ListEntry> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse test list: {}", path.display()))?;
        return entries
            .into_iter()
            .map(|entry| match entry {
                ListEntry::Name(name) => parse_name(&name),
                ListEntry::Test(test) => Ok(test),
            })
            .collect();
    }

    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(parse_name)
        .collect()
}

fn parse_name(name: &str) -> Result<Test> {
    match Test::parse(name) {
        Some(test) => Ok(test),
        None => bail!("Invalid test name {:?}, expected package.Class#method", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_parse_without_package() {
        let test = Test::parse("LoginTest#works").unwrap();
        assert_eq!(test.package, "");
        assert_eq!(test.class, "LoginTest");
        assert_eq!(test.name(), "LoginTest#works");
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        assert!(Test::parse("com.example.LoginTest").is_none());
        assert!(Test::parse("com.example.#method").is_none());
        assert!(Test::parse("com.example.LoginTest#").is_none());
    }

    #[test]
    fn test_equality_ignores_metadata() {
        let plain = Test::new("com.example", "A", "one");
        let annotated = plain.clone().with_meta(MetaProperty::new("LargeTest"));
        assert_eq!(plain, annotated);

        let set: HashSet<Test> = [plain, annotated].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_ignore_markers() {
        let test = Test::new("p", "C", "m");
        assert!(!test.is_ignored());
        assert!(test.with_meta(MetaProperty::new("org.junit.Ignore")).is_ignored());
    }

    #[test]
    fn test_shard_flaky_count() {
        let a = Test::new("p", "C", "a");
        let b = Test::new("p", "C", "b");
        let shard = TestShard {
            tests: vec![a.clone(), b.clone()],
            flaky_tests: vec![a.clone(), a.clone()],
        };
        assert_eq!(shard.flaky_count(&a), 2);
        assert_eq!(shard.flaky_count(&b), 0);
        assert_eq!(shard.len(), 4);
    }

    #[test]
    fn test_load_plain_list() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tests.txt");
        std::fs::write(&path, "# smoke\ncom.example.A#one\n\n  com.example.B#two  \n").unwrap();

        let tests = load_tests(&path).unwrap();
        assert_eq!(
            tests,
            vec![Test::new("com.example", "A", "one"), Test::new("com.example", "B", "two")]
        );
    }

    #[test]
    fn test_load_json_list_with_metadata() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tests.json");
        std::fs::write(
            &path,
            r#"[
                "com.example.A#one",
                {"package": "com.example", "class": "B", "method": "two",
                 "metadata": [{"name": "org.junit.Ignore"}]}
            ]"#,
        )
        .unwrap();

        let tests = load_tests(&path).unwrap();
        assert_eq!(tests.len(), 2);
        assert!(!tests[0].is_ignored());
        assert!(tests[1].is_ignored());
    }

    #[test]
    fn test_load_rejects_bad_name() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tests.txt");
        std::fs::write(&path, "not-a-test\n").unwrap();

        let err = load_tests(&path).unwrap_err();
        assert!(err.to_string().contains("not-a-test"));
    }
}
