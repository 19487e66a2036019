use ipnet::IpNet;
use sqlx::{Pool, Sqlite, SqliteConnection};
use uuid::Uuid;

use crate::error::{AllocError, Result};
use crate::models::*;
use crate::utils;
use super::row_helpers::map_block_row;

const SELECT_BLOCK: &str = r#"
    SELECT b.id, b.family, b.prefix, b.prefix_length, b.role, b.binding, b.status,
           b.parent_id, b.dns_name, b.description, b.created_at, b.updated_at
    FROM address_blocks b
"#;

pub struct AddressBlockRepo;

impl AddressBlockRepo {
    /// All blocks of a family in numeric address order, larger blocks first
    pub async fn list_by_family(pool: &Pool<Sqlite>, family: AddressFamily) -> Result<Vec<AddressBlock>> {
        let rows = sqlx::query(&format!(
            "{} WHERE b.family = ? ORDER BY b.network_key, b.prefix_length",
            SELECT_BLOCK
        ))
            .bind(family.as_i64())
            .fetch_all(pool).await?;
        rows.iter().map(map_block_row).collect()
    }

    pub async fn get(pool: &Pool<Sqlite>, id: Uuid) -> Result<Option<AddressBlock>> {
        let row = sqlx::query(&format!("{} WHERE b.id = ?", SELECT_BLOCK))
            .bind(id.to_string())
            .fetch_optional(pool).await?;
        row.as_ref().map(map_block_row).transpose()
    }

    pub async fn insert(conn: &mut SqliteConnection, block: &AddressBlock) -> Result<()> {
        let (network, broadcast) = utils::bounds(&block.network);
        let result = sqlx::query(
            r#"INSERT INTO address_blocks (id, family, prefix, network_key, broadcast_key, prefix_length,
               role, binding, status, parent_id, dns_name, description, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#
        )
        .bind(block.id.to_string())
        .bind(block.family().as_i64())
        .bind(block.network.to_string())
        .bind(utils::sort_key(network))
        .bind(utils::sort_key(broadcast))
        .bind(block.prefix_len() as i64)
        .bind(block.role.as_ref().map(|r| r.as_str()).unwrap_or(""))
        .bind(block.binding.as_deref().unwrap_or(""))
        .bind(block.status.as_str())
        .bind(block.parent_id.map(|id| id.to_string()))
        .bind(block.dns_name.as_deref().unwrap_or(""))
        .bind(block.description.as_deref().unwrap_or(""))
        .bind(block.created_at)
        .bind(block.updated_at)
        .execute(conn).await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(AllocError::Overlap {
                requested: block.network,
                existing: block.network,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Blocks that conflict with an inserted `block`: anything inside its
    /// range, or anything covering it that lies below its recorded parent.
    /// A writer working from a stale pool produces exactly these.
    pub async fn find_conflicts(conn: &mut SqliteConnection, block: &AddressBlock) -> Result<Vec<(Uuid, IpNet)>> {
        let (network, broadcast) = utils::bounds(&block.network);
        let (network, broadcast) = (utils::sort_key(network), utils::sort_key(broadcast));
        let len = block.prefix_len() as i64;
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"SELECT b.id, b.prefix FROM address_blocks b
               WHERE b.family = ? AND b.id != ? AND (
                   (b.prefix_length >= ? AND b.network_key >= ? AND b.network_key <= ?)
                   OR (b.prefix_length < ? AND b.network_key <= ? AND b.broadcast_key >= ?
                       AND b.prefix_length > COALESCE(
                           (SELECT p.prefix_length FROM address_blocks p WHERE p.id = ?), -1))
               )
               ORDER BY b.network_key, b.prefix_length"#
        )
        .bind(block.family().as_i64())
        .bind(block.id.to_string())
        .bind(len)
        .bind(network.as_str())
        .bind(broadcast.as_str())
        .bind(len)
        .bind(network.as_str())
        .bind(broadcast.as_str())
        .bind(block.parent_id.map(|id| id.to_string()))
        .fetch_all(conn).await?;

        rows.into_iter()
            .map(|(id, prefix)| {
                let id = Uuid::parse_str(&id).map_err(|e| AllocError::Decode(format!("bad id {}: {}", id, e)))?;
                let net = utils::parse_cidr(&prefix).map_err(AllocError::Decode)?;
                Ok((id, net))
            })
            .collect()
    }

    pub async fn update(conn: &mut SqliteConnection, block: &AddressBlock) -> Result<()> {
        let result = sqlx::query(
            r#"UPDATE address_blocks SET role = ?, binding = ?, status = ?, parent_id = ?,
               dns_name = ?, description = ?, updated_at = ? WHERE id = ?"#
        )
        .bind(block.role.as_ref().map(|r| r.as_str()).unwrap_or(""))
        .bind(block.binding.as_deref().unwrap_or(""))
        .bind(block.status.as_str())
        .bind(block.parent_id.map(|id| id.to_string()))
        .bind(block.dns_name.as_deref().unwrap_or(""))
        .bind(block.description.as_deref().unwrap_or(""))
        .bind(block.updated_at)
        .bind(block.id.to_string())
        .execute(conn).await?;
        if result.rows_affected() == 0 {
            return Err(AllocError::not_found("Address block", block.id));
        }
        Ok(())
    }

    pub async fn delete(conn: &mut SqliteConnection, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM address_blocks WHERE id = ?")
            .bind(id.to_string())
            .execute(conn).await?;
        if result.rows_affected() == 0 {
            return Err(AllocError::not_found("Address block", id));
        }
        Ok(())
    }
}
