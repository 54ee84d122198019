//! Bucketer implementations.
//!
//! A bucketer maps a scope string to a bucket in `[0, 100)`. Buckets are compared against an
//! experiment's traffic allocation to pick between control and treatment.

/// Number of buckets subjects are spread over.
pub const TOTAL_BUCKETS: u32 = 100;

/// Delimiter used to join the parts of a scope key.
pub const SCOPE_DELIMITER: char = ':';

/// Subject token used in the scope key when no subject id is supplied.
pub const ANONYMOUS_SUBJECT: &str = "anonymous";

pub trait Bucketer: Send + Sync {
    /// Returns a bucket in `[0, TOTAL_BUCKETS)` for `scope`.
    fn bucket(&self, scope: &str) -> u32;
}

/// Build the canonical scope string that is hashed to get a subject's bucket.
///
/// `store_id` is intentionally not part of the scope: a subject keeps its variant across stores of
/// the same organization.
pub fn scope_key(org_id: &str, experiment_key: &str, subject_key: &str) -> String {
    let subject_key = if subject_key.is_empty() {
        ANONYMOUS_SUBJECT
    } else {
        subject_key
    };
    let mut scope =
        String::with_capacity(org_id.len() + experiment_key.len() + subject_key.len() + 2);
    scope.push_str(org_id);
    scope.push(SCOPE_DELIMITER);
    scope.push_str(experiment_key);
    scope.push(SCOPE_DELIMITER);
    scope.push_str(subject_key);
    scope
}

/// `hash = hash * 31 + code_unit` over UTF-16 code units, wrapping to a signed 32-bit integer on
/// every step.
pub fn rolling_hash(input: &str) -> i32 {
    input.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_mul(31).wrapping_add(i32::from(unit))
    })
}

/// The default bucketer.
///
/// Reproduces the rolling hash assignments were originally made with, bit for bit, so that
/// subjects keep their variants. Not suitable for anything security-sensitive.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollingHashBucketer;

impl Bucketer for RollingHashBucketer {
    fn bucket(&self, scope: &str) -> u32 {
        // `unsigned_abs` maps i32::MIN to 2^31 instead of overflowing.
        rolling_hash(scope).unsigned_abs() % TOTAL_BUCKETS
    }
}

/// MD5-based bucketer with a better distribution than [`RollingHashBucketer`].
///
/// Switching an organization to this bucketer reshuffles every running experiment, so it should
/// only be used when there are no pre-existing assignments to preserve.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5Bucketer;

impl Bucketer for Md5Bucketer {
    fn bucket(&self, scope: &str) -> u32 {
        let hash = md5::compute(scope);
        let value = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
        value % TOTAL_BUCKETS
    }
}
