//! Post-load verification
//!
//! Walks loaded extents and checks that every non-null reference points at
//! the start of a loaded object.

use crate::codec::{ReferenceCodec, ReferenceEncoding};
use crate::heap::HeapMemory;
use crate::object::{Address, ObjectHeader, HEADER_SIZE};
use crate::types::TypeRegistry;
use crate::{ArchiveError, ArchiveResult};
use rustc_hash::FxHashSet;

/// Counts gathered by [`verify_loaded_heap`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    /// Objects walked
    pub objects: usize,
    /// Non-null references checked
    pub references: usize,
    /// Null references seen
    pub null_references: usize,
}

struct LoadedObject {
    addr: Address,
    header: ObjectHeader,
}

/// Verify the objects laid out back to back in `extents`
pub fn verify_loaded_heap<M>(
    heap: &M,
    types: &TypeRegistry,
    encoding: ReferenceEncoding,
    extents: &[(Address, Address)],
) -> ArchiveResult<VerifyReport>
where
    M: HeapMemory + ?Sized,
{
    let codec = encoding.codec()?;
    let ref_size = codec.ref_size();
    let mut objects = Vec::new();
    let mut starts = FxHashSet::default();

    for &(bottom, top) in extents {
        let mut addr = bottom;
        while addr < top {
            let bytes = heap
                .bytes(addr, HEADER_SIZE)
                .ok_or_else(|| verify_error(format!("unreadable header at {}", addr)))?;
            let header = ObjectHeader::read(bytes)
                .ok_or_else(|| verify_error(format!("truncated header at {}", addr)))?;
            let info = types.get(header.type_index).ok_or_else(|| {
                verify_error(format!(
                    "unknown type {} at {}",
                    header.type_index.as_u32(),
                    addr
                ))
            })?;
            if !info.accepts_length(header.length) {
                return Err(verify_error(format!(
                    "{} at {} has length {}",
                    info.name, addr, header.length
                )));
            }
            starts.insert(addr);
            objects.push(LoadedObject { addr, header });
            addr = addr.add(info.object_size(header.length, ref_size));
        }
        if addr != top {
            return Err(verify_error(format!(
                "last object overruns extent {}..{}",
                bottom, top
            )));
        }
    }

    let mut report = VerifyReport {
        objects: objects.len(),
        ..VerifyReport::default()
    };
    for object in &objects {
        let info = types.require(object.header.type_index)?;
        let mut failure = None;
        info.for_each_reference_offset(object.header.length, ref_size, |offset| {
            if failure.is_some() {
                return;
            }
            let field = object.addr.add(offset);
            match heap.read_slot(field, ref_size) {
                Some(0) => report.null_references += 1,
                Some(raw) => {
                    let target = codec.decode(raw);
                    if starts.contains(&target) {
                        report.references += 1;
                    } else {
                        failure = Some(format!(
                            "{} field at {} points at {}, which is not a loaded object",
                            info.name, field, target
                        ));
                    }
                }
                None => failure = Some(format!("unreadable reference at {}", field)),
            }
        });
        if let Some(msg) = failure {
            return Err(verify_error(msg));
        }
    }
    Ok(report)
}

fn verify_error(msg: String) -> ArchiveError {
    ArchiveError::Load(format!("verification failed: {}", msg))
}
