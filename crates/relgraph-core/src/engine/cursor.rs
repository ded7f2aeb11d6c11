use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::tuple::SnapshotToken;

use super::CheckError;
use super::lookup::LookupQuery;

/// Resume point of a paginated lookup. Pins the snapshot and the query so a
/// later page sees exactly the result set the first page came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupCursor {
    pub snapshot: SnapshotToken,
    pub query: LookupQuery,
    pub after: String,
}

impl LookupCursor {
    pub fn encode(&self) -> Result<String, CheckError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| CheckError::InvalidCursor(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn decode(raw: &str) -> Result<Self, CheckError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|e| CheckError::InvalidCursor(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| CheckError::InvalidCursor(e.to_string()))
    }

    /// Decodes `raw` and checks that it was minted for `query`.
    pub fn decode_for(raw: &str, query: &LookupQuery) -> Result<Self, CheckError> {
        let cursor = Self::decode(raw)?;
        if &cursor.query != query {
            return Err(CheckError::InvalidCursor(
                "cursor belongs to a different query".to_string(),
            ));
        }
        Ok(cursor)
    }
}
