// BLOB version prefix helpers. [version: u8][wincode payload].

use crate::models::ServerSnapshot;

/// Current snapshot payload layout.
pub(super) const SNAPSHOT_BLOB_VERSION: u8 = 1;

pub(super) fn with_version_prefix(version: u8, payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(version);
    out.extend_from_slice(&payload);
    out
}

pub(super) fn blob_version(bytes: &[u8]) -> u8 {
    if bytes.is_empty() { 0 } else { bytes[0] }
}

pub(super) fn encode_snapshot(snapshot: &ServerSnapshot) -> anyhow::Result<Vec<u8>> {
    let payload =
        wincode::serialize(snapshot).map_err(|e| anyhow::anyhow!("wincode snapshot: {}", e))?;
    Ok(with_version_prefix(SNAPSHOT_BLOB_VERSION, payload))
}

/// `None` for unknown versions and payloads that no longer decode.
pub(super) fn decode_snapshot(bytes: &[u8]) -> Option<ServerSnapshot> {
    if blob_version(bytes) != SNAPSHOT_BLOB_VERSION {
        return None;
    }
    match wincode::deserialize::<ServerSnapshot>(&bytes[1..]) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::debug!(error = %e, "wincode deserialize snapshot failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MemoryInfo;

    #[test]
    fn prefix_and_decode() {
        let snap = ServerSnapshot {
            memory: MemoryInfo {
                total_kb: 2048,
                ..MemoryInfo::default()
            },
            ..ServerSnapshot::default()
        };
        let bytes = encode_snapshot(&snap).unwrap();
        assert_eq!(blob_version(&bytes), SNAPSHOT_BLOB_VERSION);
        assert_eq!(decode_snapshot(&bytes), Some(snap));
    }

    #[test]
    fn unknown_version_and_garbage_are_undecodable() {
        assert_eq!(decode_snapshot(&[]), None);
        assert_eq!(decode_snapshot(&[9, 1, 2, 3]), None);
        assert_eq!(decode_snapshot(&[SNAPSHOT_BLOB_VERSION, 0xff]), None);
    }
}
