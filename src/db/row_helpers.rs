use sqlx::{Row, sqlite::SqliteRow};
use uuid::Uuid;

use crate::error::{AllocError, Result};
use crate::models::*;
use crate::utils;

/// Filter empty strings to None; optional columns store '' instead of NULL
pub fn none_if_empty(opt: Option<String>) -> Option<String> {
    opt.filter(|s| !s.is_empty())
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| AllocError::Decode(format!("bad id {}: {}", raw, e)))
}

/// Map a SQLite row to an AddressBlock
pub fn map_block_row(row: &SqliteRow) -> Result<AddressBlock> {
    let id: String = row.try_get("id")?;
    let prefix: String = row.try_get("prefix")?;
    let status: String = row.try_get("status")?;
    let parent_id: Option<String> = row.try_get("parent_id")?;

    let network = utils::parse_cidr(&prefix).map_err(AllocError::Decode)?;
    let family = AddressFamily::from_i64(row.try_get("family")?)
        .ok_or_else(|| AllocError::Decode(format!("bad family for {}", prefix)))?;
    if family != AddressFamily::of(&network) {
        return Err(AllocError::Decode(format!("family mismatch for {}", prefix)));
    }

    Ok(AddressBlock {
        id: parse_uuid(&id)?,
        network,
        status: status.parse().map_err(AllocError::Decode)?,
        role: none_if_empty(row.try_get("role")?).map(Role::from),
        binding: none_if_empty(row.try_get("binding")?),
        parent_id: match none_if_empty(parent_id) {
            Some(raw) => Some(parse_uuid(&raw)?),
            None => None,
        },
        dns_name: none_if_empty(row.try_get("dns_name")?),
        description: none_if_empty(row.try_get("description")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
