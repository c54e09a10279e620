//! Deterministic block encoding.
//!
//! Every record in the database (events and tree nodes) is a dag-cbor block
//! addressed by a CIDv1 with a SHA-256 multihash. dag-cbor map keys are
//! canonically ordered, so equivalent records hash to the same CID on every
//! replica.

use bytes::Bytes;
use cid::multihash::{Code, MultihashDigest};
use cid::Cid;
use libipld::cbor::DagCborCodec;
use libipld::prelude::Codec as _;
use libipld::Ipld;

use crate::error::{Error, Result};

pub(crate) const DAG_CBOR: u64 = 0x71;

/// Encode a value without deriving its CID.
pub(crate) fn encode_bytes(ipld: &Ipld) -> Result<Vec<u8>> {
    let bytes = DagCborCodec
        .encode(ipld)
        .map_err(|e| Error::Encode(e.to_string()))?;
    Ok(bytes.to_vec())
}

/// Encode a value and derive the CID of the resulting block.
pub(crate) fn encode(ipld: &Ipld) -> Result<(Cid, Bytes)> {
    let bytes = encode_bytes(ipld)?;
    let hash = Code::Sha2_256.digest(&bytes);
    let cid = Cid::new_v1(DAG_CBOR, hash);
    Ok((cid, Bytes::from(bytes)))
}

pub(crate) fn decode(cid: &Cid, bytes: &[u8]) -> Result<Ipld> {
    DagCborCodec.decode(bytes).map_err(|e| Error::Decode {
        cid: *cid,
        reason: e.to_string(),
    })
}
