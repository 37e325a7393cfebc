use std::sync::LazyLock;

use regex::Regex;

/// Rejection classes surfaced to callers. Every rejection is audited with
/// `success = false` and the query never reaches the driver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryGuardError {
    #[error("dangerous operation rejected: {0}")]
    DangerousOperation(String),

    #[error("dangerous function rejected: {0}")]
    DangerousFunction(String),

    #[error("UPDATE/DELETE requires a WHERE clause")]
    MissingWhere,

    #[error("multiple statements are not allowed")]
    MultipleStatements,

    #[error("possible injection pattern: {0}")]
    InjectionPattern(String),

    #[error("UNION-based injection pattern")]
    UnionInjection,

    #[error("dangerous command rejected: {0}")]
    DangerousCommand(String),
}

impl QueryGuardError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DangerousOperation(_) => "DangerousOperation",
            Self::DangerousFunction(_) => "DangerousFunction",
            Self::MissingWhere => "MissingWhere",
            Self::MultipleStatements => "MultipleStatements",
            Self::InjectionPattern(_) => "InjectionPattern",
            Self::UnionInjection => "UnionInjection",
            Self::DangerousCommand(_) => "DangerousCommand",
        }
    }
}

const DENY_KEYWORDS: &[&str] = &["DROP", "TRUNCATE", "ALTER", "RENAME", "GRANT", "REVOKE"];

const DENY_CREATE_TARGETS: &[&str] = &[
    "DATABASE",
    "TABLE",
    "INDEX",
    "VIEW",
    "PROCEDURE",
    "FUNCTION",
    "TRIGGER",
];

const DENY_FUNCTIONS: &[&str] = &[
    "LOAD_FILE",
    "INTO OUTFILE",
    "DUMPFILE",
    "XP_CMDSHELL",
    "EXEC(",
    "EXECUTE(",
    "SHELL_EXEC",
    "SYSTEM(",
];

const DENY_REDIS: &[&str] = &[
    "FLUSHDB",
    "FLUSHALL",
    "SHUTDOWN",
    "CONFIG",
    "SAVE",
    "BGSAVE",
    "BGREWRITEAOF",
    "DEBUG",
    "SLAVEOF",
    "REPLICAOF",
    "SCRIPT",
    "EVAL",
    "EVALSHA",
    "MODULE",
];

static LINE_COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"--[^\n]*").unwrap());
static BLOCK_COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());

static RAW_DENY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(DROP|TRUNCATE|ALTER|RENAME|GRANT|REVOKE)\b").unwrap()
});
static RAW_CREATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bCREATE\s+(DATABASE|TABLE|INDEX|VIEW|PROCEDURE|FUNCTION|TRIGGER)\b").unwrap()
});
static RAW_LOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(UNLOCK|LOCK)\s+TABLES\b").unwrap());

static WHERE_TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bWHERE\b").unwrap());

static UNION_SELECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bUNION(\s+ALL)?\s+SELECT\b").unwrap());
static TIME_BASED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(SLEEP|BENCHMARK|WAITFOR)\b").unwrap());
static HEX_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)0x[0-9a-f]{2,}").unwrap());
static BOOL_NUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(OR|AND)\s+\d+\s*=\s*\d+").unwrap());
static BOOL_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(OR|AND)\s+'([^']*)'\s*=\s*'([^']*)'").unwrap());
static OR_TRUE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bOR\s+TRUE\b").unwrap());
static CHAR_CALL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bCHAR\s*\(").unwrap());
static CONCAT_CALL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bCONCAT\s*\(").unwrap());
static QUOTED_STRING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"'[^']*'|"[^"]*""#).unwrap());
static BASE64_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9+/]{20,}={0,2}").unwrap());

/// Validate a SQL query before execution. Comments are stripped, the input is
/// split on `;`, and every non-empty statement must pass every rule.
pub fn validate_sql(query: &str) -> Result<(), QueryGuardError> {
    for raw_statement in query.split(';') {
        let stripped = strip_comments(raw_statement);
        let statement = stripped.trim();
        if statement.is_empty() {
            continue;
        }
        check_statement(statement, raw_statement)?;
    }
    Ok(())
}

/// Number of non-empty statements after comment stripping. The executor
/// refuses more than one per request with `MultipleStatements`.
pub fn statement_count(query: &str) -> usize {
    query
        .split(';')
        .map(strip_comments)
        .filter(|s| !s.trim().is_empty())
        .count()
}

/// First keyword of the first statement, uppercased — recorded as the
/// query type of a session (`SELECT`, `INSERT`, ...).
pub fn query_type(query: &str) -> String {
    query
        .split(';')
        .map(strip_comments)
        .find_map(|s| s.split_whitespace().next().map(str::to_uppercase))
        .unwrap_or_default()
}

/// Validate a Redis command line: the first token must not be an
/// administrative or destructive command.
pub fn validate_redis(command: &str) -> Result<(), QueryGuardError> {
    let Some(first) = command.split_whitespace().next() else {
        return Ok(());
    };
    let upper = first.to_uppercase();
    if DENY_REDIS.contains(&upper.as_str()) {
        return Err(QueryGuardError::DangerousCommand(upper));
    }
    Ok(())
}

fn strip_comments(statement: &str) -> String {
    let no_blocks = BLOCK_COMMENT.replace_all(statement, " ");
    LINE_COMMENT.replace_all(&no_blocks, " ").into_owned()
}

fn check_statement(statement: &str, raw: &str) -> Result<(), QueryGuardError> {
    check_denied_operations(statement, raw)?;
    check_missing_where(statement)?;
    check_denied_functions(statement)?;
    check_injection(statement)?;
    Ok(())
}

fn check_denied_operations(statement: &str, raw: &str) -> Result<(), QueryGuardError> {
    let mut tokens = statement.split_whitespace();
    let first = tokens.next().map(str::to_uppercase).unwrap_or_default();
    let second = tokens.next().map(str::to_uppercase).unwrap_or_default();

    if DENY_KEYWORDS.contains(&first.as_str()) {
        return Err(QueryGuardError::DangerousOperation(first));
    }
    if first == "CREATE" && DENY_CREATE_TARGETS.contains(&second.as_str()) {
        return Err(QueryGuardError::DangerousOperation(format!("CREATE {second}")));
    }
    if (first == "LOCK" || first == "UNLOCK") && second == "TABLES" {
        return Err(QueryGuardError::DangerousOperation(format!("{first} {second}")));
    }

    // The raw statement is scanned too, so a denylisted keyword smuggled
    // inside a comment still trips.
    if let Some(m) = RAW_DENY.find(raw) {
        return Err(QueryGuardError::DangerousOperation(
            m.as_str().to_uppercase(),
        ));
    }
    if RAW_CREATE.is_match(raw) {
        return Err(QueryGuardError::DangerousOperation("CREATE".into()));
    }
    if let Some(m) = RAW_LOCK.find(raw) {
        return Err(QueryGuardError::DangerousOperation(
            m.as_str().to_uppercase(),
        ));
    }
    Ok(())
}

fn check_missing_where(statement: &str) -> Result<(), QueryGuardError> {
    let first = statement
        .split_whitespace()
        .next()
        .map(str::to_uppercase)
        .unwrap_or_default();
    if (first == "UPDATE" || first == "DELETE") && !WHERE_TOKEN.is_match(statement) {
        return Err(QueryGuardError::MissingWhere);
    }
    Ok(())
}

fn check_denied_functions(statement: &str) -> Result<(), QueryGuardError> {
    let upper = statement.to_uppercase();
    let compact: String = upper.split_whitespace().collect::<Vec<_>>().join(" ");
    for func in DENY_FUNCTIONS {
        if compact.contains(func) {
            return Err(QueryGuardError::DangerousFunction((*func).to_owned()));
        }
    }
    Ok(())
}

fn check_injection(statement: &str) -> Result<(), QueryGuardError> {
    if UNION_SELECT.is_match(statement) {
        return Err(QueryGuardError::UnionInjection);
    }
    if let Some(m) = TIME_BASED.find(statement) {
        return Err(QueryGuardError::InjectionPattern(format!(
            "time-based function {}",
            m.as_str().to_uppercase()
        )));
    }
    if HEX_LITERAL.find_iter(statement).count() >= 3 {
        return Err(QueryGuardError::InjectionPattern(
            "multiple hex literals".into(),
        ));
    }
    if BOOL_NUMERIC.is_match(statement) || OR_TRUE.is_match(statement) {
        return Err(QueryGuardError::InjectionPattern(
            "boolean tautology".into(),
        ));
    }
    for caps in BOOL_QUOTED.captures_iter(statement) {
        if caps.get(2).map(|m| m.as_str()) == caps.get(3).map(|m| m.as_str()) {
            return Err(QueryGuardError::InjectionPattern(
                "boolean tautology".into(),
            ));
        }
    }
    if CHAR_CALL.find_iter(statement).count() >= 4 {
        return Err(QueryGuardError::InjectionPattern(
            "excessive CHAR() calls".into(),
        ));
    }
    if CONCAT_CALL.find_iter(statement).count() >= 6 {
        return Err(QueryGuardError::InjectionPattern(
            "excessive CONCAT() calls".into(),
        ));
    }
    check_base64_runs(statement)?;
    Ok(())
}

/// Long unquoted base64-looking runs are a common exfiltration/obfuscation
/// vehicle. Quoted literals are exempt; a run only counts when it mixes
/// cases and digits.
fn check_base64_runs(statement: &str) -> Result<(), QueryGuardError> {
    let unquoted = QUOTED_STRING.replace_all(statement, " ");
    for m in BASE64_RUN.find_iter(&unquoted) {
        let run = m.as_str();
        let has_digit = run.chars().any(|c| c.is_ascii_digit());
        let has_upper = run.chars().any(|c| c.is_ascii_uppercase());
        let has_lower = run.chars().any(|c| c.is_ascii_lowercase());
        if has_digit && has_upper && has_lower {
            return Err(QueryGuardError::InjectionPattern(
                "unquoted base64-like run".into(),
            ));
        }
    }
    Ok(())
}
