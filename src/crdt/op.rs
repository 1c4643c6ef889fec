//! Operations on a replicated sequence, and their signed wire form.
//!
//! Operations are intention-preserving: they name the elements they touch by
//! [`Identifier`], never by visible index, so they mean the same thing on
//! every replica regardless of what else has happened there.
//!
//! - Insert: "this character goes between these two elements"
//! - Delete: "this element is gone"
//! - Replace: "all of these are gone, and this run replaces them", used to
//!   revert to a snapshot as one forward operation
//!
//! Each operation carries its author and a per-author sequence number so
//! the log can key it by `(replica, seq)` and receivers can apply one
//! author's operations in order.

use serde::Deserialize;
use serde::Serialize;
use smallvec::SmallVec;

use crate::crdt::id::Identifier;
use crate::error::Error;
use crate::error::Result;
use crate::key::ReplicaId;
use crate::key::ReplicaKey;
use crate::key::Signature;

/// Domain tag mixed into the signed digest.
const SIGNING_CONTEXT: &[u8] = b"cowrite.operation.v1";

/// One inserted character and its insertion context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Insert {
    pub id: Identifier,
    pub value: char,
    /// The element immediately left of the new one when it was inserted.
    pub origin_left: Identifier,
    /// The element immediately right of the new one when it was inserted.
    pub origin_right: Identifier,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpKind {
    Insert(Insert),
    Delete { id: Identifier },
    /// Tombstone every id in `deletes`, then integrate `inserts` in order.
    /// Later inserts may use earlier ones as origins.
    Replace {
        deletes: Vec<Identifier>,
        inserts: Vec<Insert>,
    },
}

/// An operation as stored in the log and sent between replicas.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub replica: ReplicaId,
    pub seq: u64,
    #[serde(flatten)]
    pub kind: OpKind,
}

/// An operation with its author's signature over it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedOperation {
    pub op: Operation,
    pub signature: Signature,
}

impl Operation {
    /// The log key of this operation.
    pub fn key(&self) -> (ReplicaId, u64) {
        return (self.replica, self.seq);
    }

    /// Elements that must already exist before this operation can apply.
    ///
    /// Sentinels always exist and are left out, as are ids minted earlier in
    /// the same `Replace`.
    pub fn dependencies(&self) -> SmallVec<[Identifier; 2]> {
        let mut deps = SmallVec::new();
        match &self.kind {
            OpKind::Insert(insert) => {
                push_dep(&mut deps, insert.origin_left);
                push_dep(&mut deps, insert.origin_right);
            }
            OpKind::Delete { id } => push_dep(&mut deps, *id),
            OpKind::Replace { deletes, inserts } => {
                for id in deletes {
                    push_dep(&mut deps, *id);
                }
                for (i, insert) in inserts.iter().enumerate() {
                    let minted = |id: &Identifier| inserts[..i].iter().any(|prior| prior.id == *id);
                    if !minted(&insert.origin_left) {
                        push_dep(&mut deps, insert.origin_left);
                    }
                    if !minted(&insert.origin_right) {
                        push_dep(&mut deps, insert.origin_right);
                    }
                }
            }
        }
        return deps;
    }

    /// Inserts carried by this operation, in application order.
    pub fn inserts(&self) -> &[Insert] {
        match &self.kind {
            OpKind::Insert(insert) => return std::slice::from_ref(insert),
            OpKind::Delete { .. } => return &[],
            OpKind::Replace { inserts, .. } => return inserts,
        }
    }

    fn signable(&self) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(self)?;
        let mut hasher = blake3::Hasher::new();
        hasher.update(SIGNING_CONTEXT);
        hasher.update(&(body.len() as u64).to_le_bytes());
        hasher.update(&body);
        return Ok(hasher.finalize().as_bytes().to_vec());
    }

    /// Sign this operation with its author's key.
    pub fn sign(self, key: &ReplicaKey) -> Result<SignedOperation> {
        let signature = key.sign(&self.signable()?);
        return Ok(SignedOperation { op: self, signature });
    }
}

fn push_dep(deps: &mut SmallVec<[Identifier; 2]>, id: Identifier) {
    if !id.is_sentinel() && !deps.contains(&id) {
        deps.push(id);
    }
}

impl SignedOperation {
    /// Check the signature and that every minted id belongs to the signer.
    pub fn verify(&self) -> Result<()> {
        let bad = || Error::BadSignature {
            replica: self.op.replica,
            seq: self.op.seq,
        };
        if self.op.inserts().iter().any(|insert| insert.id.replica != self.op.replica) {
            return Err(bad());
        }
        if !self.op.replica.verify(&self.op.signable()?, &self.signature) {
            return Err(bad());
        }
        return Ok(());
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        return Ok(serde_json::to_vec(self)?);
    }

    pub fn decode(bytes: &[u8]) -> Result<SignedOperation> {
        return Ok(serde_json::from_slice(bytes)?);
    }
}
