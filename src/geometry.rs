//! User-defined geometry predicates for MATCH constraints.
//!
//! A predicate is registered once per connection under a name, mirroring a
//! host scalar function. Using it in a query (`column MATCH f(a, b, ...)`)
//! produces an opaque blob which the cursor later decodes back into a
//! callback plus a per-cursor [`GeometryState`]. The blob carries a magic
//! word, the registry token of the callback, the argument count and the
//! wide-coordinate arguments, all big-endian; callback and context never
//! leave the registry.
//!
//! During a scan the callback is asked whether a bounding box may satisfy
//! the predicate. [`Containment::Disjoint`] prunes the box (and the whole
//! subtree below it, for internal cells); any other answer keeps it.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::coord::WideCoord;
use crate::error::{RtreeError, RtreeResult};
use crate::rtree::codec::{read_i64, read_u32, write_i64, write_u32};
use crate::rtree::constants::GEOMETRY_MAGIC;
use crate::value::Value;

/// Relationship between a bounding box and a geometry predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Containment {
    /// The box cannot contain matching rows.
    Disjoint,
    /// The box may contain matching rows.
    Overlaps,
    /// The box lies entirely inside the predicate's region.
    Within,
}

/// Per-cursor state handed to a geometry callback on every test.
///
/// `params` are the arguments given at the MATCH site. `user` is storage
/// owned by the callback for the lifetime of one cursor scan; it is dropped
/// with the cursor.
pub struct GeometryState {
    pub params: Vec<WideCoord>,
    pub user: Option<Box<dyn Any + Send>>,
}

/// A registered geometry predicate. Implementations carry their own context.
pub trait GeometryCallback: Send + Sync {
    /// Tests the box `coords` (`2 * dim` values, `(lo, hi)` pairs) against
    /// the predicate. Errors propagate to the caller as host errors.
    fn test(&self, state: &mut GeometryState, coords: &[WideCoord]) -> RtreeResult<Containment>;
}

struct RegistryInner {
    tokens: HashMap<String, u64>,
    callbacks: HashMap<u64, Arc<dyn GeometryCallback>>,
    next_token: u64,
}

/// Registry of geometry predicates available to MATCH constraints.
pub struct GeometryRegistry {
    inner: RwLock<RegistryInner>,
}

/// Blob header: magic word, callback token, parameter count.
const MATCH_HEADER: usize = 4 + 8 + 4;

impl GeometryRegistry {
    pub fn new() -> GeometryRegistry {
        GeometryRegistry {
            inner: RwLock::new(RegistryInner {
                tokens: HashMap::new(),
                callbacks: HashMap::new(),
                next_token: 1,
            }),
        }
    }

    /// Registers `callback` under `name`, replacing any previous predicate
    /// with that name. Returns the assigned token.
    pub fn register(&self, name: &str, callback: Arc<dyn GeometryCallback>) -> u64 {
        let mut inner = self.inner.write();
        let token = inner.next_token;
        inner.next_token += 1;
        inner.tokens.insert(name.to_string(), token);
        inner.callbacks.insert(token, callback);
        token
    }

    /// Evaluates the registered scalar function `name(params...)`: produces
    /// the blob a MATCH right-hand side carries.
    pub fn build_match(&self, name: &str, params: &[WideCoord]) -> RtreeResult<Value> {
        let inner = self.inner.read();
        let token = *inner.tokens.get(name).ok_or_else(|| {
            RtreeError::constraint(format!("no geometry function named {:?}", name))
        })?;

        let mut blob = vec![0u8; MATCH_HEADER + params.len() * 8];
        let mut off = write_u32(&mut blob, GEOMETRY_MAGIC);
        off += write_i64(&mut blob[off..], token as i64);
        off += write_u32(&mut blob[off..], params.len() as u32);
        for p in params {
            off += write_i64(&mut blob[off..], p.to_bits() as i64);
        }
        debug_assert_eq!(off, blob.len());
        Ok(Value::Blob(blob))
    }

    fn resolve(&self, token: u64) -> Option<Arc<dyn GeometryCallback>> {
        self.inner.read().callbacks.get(&token).cloned()
    }
}

impl Default for GeometryRegistry {
    fn default() -> Self {
        GeometryRegistry::new()
    }
}

/// A decoded MATCH constraint: the callback and its per-cursor state.
pub(crate) struct GeometryQuery {
    pub callback: Arc<dyn GeometryCallback>,
    pub state: GeometryState,
}

/// Decodes the right-hand side of a MATCH operator. Rejects anything that
/// is not a blob of exactly the declared size opening with the magic word.
pub(crate) fn decode_match(registry: &GeometryRegistry, value: &Value) -> RtreeResult<GeometryQuery> {
    let blob = value
        .as_blob()
        .ok_or_else(|| RtreeError::constraint("MATCH operand is not a geometry blob"))?;
    if blob.len() < MATCH_HEADER || (blob.len() - MATCH_HEADER) % 8 != 0 {
        return Err(RtreeError::constraint("geometry blob has the wrong size"));
    }
    if read_u32(blob) != GEOMETRY_MAGIC {
        return Err(RtreeError::constraint("geometry blob has the wrong magic"));
    }
    let token = read_i64(&blob[4..]) as u64;
    let n_param = read_u32(&blob[12..]) as usize;
    if blob.len() != MATCH_HEADER + n_param * 8 {
        return Err(RtreeError::constraint("geometry blob has the wrong size"));
    }
    let callback = registry
        .resolve(token)
        .ok_or_else(|| RtreeError::constraint("geometry blob names an unknown function"))?;

    let params = (0..n_param)
        .map(|i| f64::from_bits(read_i64(&blob[MATCH_HEADER + i * 8..]) as u64))
        .collect();
    Ok(GeometryQuery {
        callback,
        state: GeometryState { params, user: None },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A box predicate: within/overlaps/disjoint against the box given as
    /// parameters `(lo0, hi0, lo1, hi1, ...)`.
    struct BoxTest;

    impl GeometryCallback for BoxTest {
        fn test(
            &self,
            state: &mut GeometryState,
            coords: &[WideCoord],
        ) -> RtreeResult<Containment> {
            let mut within = true;
            for d in 0..coords.len() / 2 {
                let (qlo, qhi) = (state.params[d * 2], state.params[d * 2 + 1]);
                let (lo, hi) = (coords[d * 2], coords[d * 2 + 1]);
                if hi < qlo || lo > qhi {
                    return Ok(Containment::Disjoint);
                }
                if lo < qlo || hi > qhi {
                    within = false;
                }
            }
            Ok(if within {
                Containment::Within
            } else {
                Containment::Overlaps
            })
        }
    }

    #[test]
    fn test_register_and_roundtrip() {
        let registry = GeometryRegistry::new();
        registry.register("boxtest", Arc::new(BoxTest));

        let blob = registry.build_match("boxtest", &[0.0, 10.0, 0.0, 10.0]).unwrap();
        let mut query = decode_match(&registry, &blob).unwrap();
        assert_eq!(query.state.params, vec![0.0, 10.0, 0.0, 10.0]);

        let r = query
            .callback
            .test(&mut query.state, &[2.0, 3.0, 2.0, 3.0])
            .unwrap();
        assert_eq!(r, Containment::Within);
        let r = query
            .callback
            .test(&mut query.state, &[20.0, 30.0, 2.0, 3.0])
            .unwrap();
        assert_eq!(r, Containment::Disjoint);
    }

    #[test]
    fn test_unknown_function() {
        let registry = GeometryRegistry::new();
        assert!(registry.build_match("nope", &[]).is_err());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let registry = GeometryRegistry::new();
        registry.register("boxtest", Arc::new(BoxTest));
        let blob = registry.build_match("boxtest", &[1.0]).unwrap();
        let mut bytes = blob.as_blob().unwrap().to_vec();
        bytes[0] ^= 0xFF;
        assert!(decode_match(&registry, &Value::Blob(bytes)).is_err());
    }

    #[test]
    fn test_bad_size_rejected() {
        let registry = GeometryRegistry::new();
        registry.register("boxtest", Arc::new(BoxTest));
        let blob = registry.build_match("boxtest", &[1.0, 2.0]).unwrap();
        let mut bytes = blob.as_blob().unwrap().to_vec();
        bytes.pop();
        assert!(decode_match(&registry, &Value::Blob(bytes)).is_err());
        // Truncating a whole parameter still disagrees with the declared count.
        let mut bytes = blob.as_blob().unwrap().to_vec();
        bytes.truncate(bytes.len() - 8);
        assert!(decode_match(&registry, &Value::Blob(bytes)).is_err());
    }

    #[test]
    fn test_non_blob_rejected() {
        let registry = GeometryRegistry::new();
        assert!(decode_match(&registry, &Value::Integer(5)).is_err());
    }

    #[test]
    fn test_unregistered_token_rejected() {
        let registry = GeometryRegistry::new();
        registry.register("boxtest", Arc::new(BoxTest));
        let blob = registry.build_match("boxtest", &[]).unwrap();
        let other = GeometryRegistry::new();
        assert!(decode_match(&other, &blob).is_err());
    }
}
