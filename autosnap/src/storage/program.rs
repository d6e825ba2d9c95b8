//! ZFS channel programs backing each batch category.
//!
//! Every program checks all of its operands with `zfs.check.*` before
//! touching any of them with `zfs.sync.*`, so a request that fails its
//! checks changes nothing. The whole script runs in one transaction group.

use crate::engine::batch::{BatchCategory, BatchRequest};

/// argv: snapshot names, at most one per dataset.
///
/// A second snapshot of a dataset in the same transaction group fails at
/// sync time, after earlier operands were written, so duplicates are
/// refused up front.
pub const CREATE_SNAPSHOTS: &str = r#"args = ...
argv = args["argv"]
seen = {}

for _, snap in ipairs(argv) do
    ds = string.match(snap, "^([^@]+)@")
    if ds == nil then
        error("not a snapshot name: " .. snap)
    end
    if seen[ds] then
        error("more than one snapshot of " .. ds .. " in one request")
    end
    seen[ds] = true
    err = zfs.check.snapshot(snap)
    if err ~= 0 then
        error("cannot create " .. snap .. ": errno " .. err)
    end
end

for _, snap in ipairs(argv) do
    err = zfs.sync.snapshot(snap)
    if err ~= 0 then
        error("failed to create " .. snap .. ": errno " .. err)
    end
end
"#;

/// argv: snapshot names.
pub const DESTROY_SNAPSHOTS: &str = r#"args = ...
argv = args["argv"]

for _, snap in ipairs(argv) do
    err = zfs.check.destroy(snap)
    if err ~= 0 then
        error("cannot destroy " .. snap .. ": errno " .. err)
    end
end

for _, snap in ipairs(argv) do
    err = zfs.sync.destroy(snap)
    if err ~= 0 then
        error("failed to destroy " .. snap .. ": errno " .. err)
    end
end
"#;

/// argv: property, new value, then (dataset, expected value) pairs.
///
/// An unset user property reads as nil and compares equal to "-".
pub const SET_OWNER: &str = r#"args = ...
argv = args["argv"]
prop = argv[1]
value = argv[2]

if (#argv - 2) % 2 ~= 0 then
    error("dataset/expected arguments must come in pairs")
end

for i = 3, #argv, 2 do
    ds = argv[i]
    expected = argv[i + 1]
    current = zfs.get_prop(ds, prop)
    if current == nil or current == "" then
        current = "-"
    end
    if current ~= expected then
        error(ds .. ": " .. prop .. " is " .. current .. ", expected " .. expected)
    end
    err = zfs.check.set_prop(ds, prop, value)
    if err ~= 0 then
        error("cannot set " .. prop .. " on " .. ds .. ": errno " .. err)
    end
end

for i = 3, #argv, 2 do
    err = zfs.sync.set_prop(argv[i], prop, value)
    if err ~= 0 then
        error("failed to set " .. prop .. " on " .. argv[i] .. ": errno " .. err)
    end
end
"#;

/// Program source for a category.
pub fn source(category: BatchCategory) -> &'static str {
    match category {
        BatchCategory::CreateSnapshots => CREATE_SNAPSHOTS,
        BatchCategory::DestroySnapshots => DESTROY_SNAPSHOTS,
        BatchCategory::MarkOwnerHere | BatchCategory::MarkOwnerStopped => SET_OWNER,
    }
}

/// Script arguments for `request`, in the order its program expects them.
pub fn program_args(request: &BatchRequest<'_>, owner_property: &str) -> Vec<String> {
    match request {
        BatchRequest::CreateSnapshots(names) | BatchRequest::DestroySnapshots(names) => {
            names.to_vec()
        }
        BatchRequest::SetOwner { value, marks, .. } => {
            let mut args = Vec::with_capacity(2 + marks.len() * 2);
            args.push(owner_property.to_string());
            args.push(value.to_string());
            for mark in marks.iter() {
                args.push(mark.dataset.clone());
                args.push(mark.observed.as_property().to_string());
            }
            args
        }
    }
}
