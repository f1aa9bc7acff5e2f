//! Role resolution at run start.

use std::collections::BTreeMap;

use dashmap::DashMap;

use super::RunId;
use crate::connection::ConnectionManager;
use crate::device::{DeviceHandle, DeviceId};
use crate::error::{LabError, LabResult};
use crate::method::{MethodDefinition, RoleName, RoleRequirement};

/// Explicit role → device id assignments supplied with a submission.
pub type RoleBindings = BTreeMap<RoleName, DeviceId>;

fn compatible(handle: &DeviceHandle, req: &RoleRequirement) -> bool {
    handle.category() == req.category
        && req
            .vendor_model
            .as_deref()
            .map_or(true, |vm| handle.spec().identity.vendor_model() == vm)
}

fn describe(req: &RoleRequirement) -> String {
    match &req.vendor_model {
        Some(vm) => format!("{} ({vm})", req.category),
        None => req.category.to_string(),
    }
}

/// Resolve every declared role to an open device.
///
/// Order: explicit binding, then the device whose id equals the role name,
/// then the only free open device that satisfies the requirement. A device
/// reserved by another active run is never bound.
pub(crate) fn resolve(
    method: &MethodDefinition,
    explicit: &RoleBindings,
    connections: &ConnectionManager,
    reservations: &DashMap<DeviceId, RunId>,
) -> LabResult<BTreeMap<RoleName, DeviceHandle>> {
    let open = connections.handles();
    let holder = |h: &DeviceHandle| reservations.get(h.id()).map(|r| *r.value());
    let mut bound = BTreeMap::new();

    for (role, req) in method.roles() {
        let unbound = |reason: String| LabError::UnboundRole {
            role: role.clone(),
            reason,
        };

        let handle = if let Some(id) = explicit.get(role) {
            let handle = open
                .iter()
                .find(|h| h.id() == id)
                .ok_or_else(|| unbound(format!("device '{id}' is not open")))?;
            if !compatible(handle, req) {
                return Err(unbound(format!(
                    "device '{id}' is a {}, role needs a {}",
                    handle.category(),
                    describe(req)
                )));
            }
            handle.clone()
        } else if let Some(handle) = open.iter().find(|h| h.id() == role && compatible(h, req)) {
            handle.clone()
        } else {
            let candidates: Vec<&DeviceHandle> = open.iter().filter(|h| compatible(h, req)).collect();
            let free: Vec<&DeviceHandle> =
                candidates.iter().copied().filter(|h| holder(h).is_none()).collect();
            match free.as_slice() {
                [only] => (*only).clone(),
                [] if candidates.is_empty() => {
                    return Err(unbound(format!("no open {} device", describe(req))))
                }
                [] => {
                    return Err(unbound(format!(
                        "every open {} device is in use by another run",
                        describe(req)
                    )))
                }
                many => {
                    let ids: Vec<&str> = many.iter().map(|h| h.id()).collect();
                    return Err(unbound(format!(
                        "ambiguous, candidates: {}; bind it explicitly",
                        ids.join(", ")
                    )));
                }
            }
        };
        if let Some(run) = holder(&handle) {
            return Err(unbound(format!(
                "device '{}' is in use by run {run}",
                handle.id()
            )));
        }
        bound.insert(role.clone(), handle);
    }

    Ok(bound)
}

/// Check that each bound device negotiated the capabilities its steps and
/// preconditions use.
pub(crate) fn check_capabilities(
    method: &MethodDefinition,
    bound: &BTreeMap<RoleName, DeviceHandle>,
) -> LabResult<()> {
    for step in method.steps() {
        let uses = std::iter::once((step.role.as_str(), step.operation.capability())).chain(
            step.precondition
                .as_ref()
                .map(|p| (p.role(), p.capability())),
        );
        for (role, capability) in uses {
            let Some(handle) = bound.get(role) else {
                continue;
            };
            if !handle.supports(capability) {
                return Err(LabError::CapabilityMismatch {
                    step: step.id.clone(),
                    device: handle.id().to_string(),
                    capability: capability.name().to_string(),
                });
            }
        }
    }
    Ok(())
}
