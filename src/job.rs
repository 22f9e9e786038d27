use super::*;

/// A unit of work pushed by a pool. Pools decorate jobs with fields the proxy
/// has no opinion about (`algo`, `height`, `seed_hash`, ...), so everything
/// beyond the fields the proxy reads or rewrites passes through untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub job_id: String,
    pub blob: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Job {
    pub fn retarget(&mut self, difficulty: Difficulty) {
        self.target = difficulty.target_hex();
    }
}
