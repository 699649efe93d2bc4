use crate::context::geo::GeoPoint;
use crate::node::error::NodeResult;
use crate::node::types::{NodeType, StorageNode};
use sqlx::{Row, SqlitePool};

/// Persistent catalogue of known storage nodes. The in-memory registry is
/// rebuilt from this table on startup.
#[derive(Clone)]
pub struct NodeStore {
    pool: SqlitePool,
}

impl NodeStore {
    pub async fn new(pool: SqlitePool) -> NodeResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                address TEXT NOT NULL,
                port INTEGER NOT NULL,
                node_type TEXT NOT NULL,
                lat REAL,
                lng REAL,
                bw_up INTEGER NOT NULL,
                bw_down INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Inserts the node, or replaces the stored row when the id is known.
    pub async fn upsert(&self, node: &StorageNode) -> NodeResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO nodes
            (id, address, port, node_type, lat, lng, bw_up, bw_down)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&node.id)
        .bind(&node.address)
        .bind(node.port as i64)
        .bind(node.node_type.as_str())
        .bind(node.location.map(|l| l.latitude))
        .bind(node.location.map(|l| l.longitude))
        .bind(node.bandwidth_up as i64)
        .bind(node.bandwidth_down as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> NodeResult<Option<StorageNode>> {
        let row = sqlx::query("SELECT * FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(row_to_node).transpose()?)
    }

    pub async fn list_all(&self) -> NodeResult<Vec<StorageNode>> {
        let rows = sqlx::query("SELECT * FROM nodes ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|r| row_to_node(r).map_err(Into::into))
            .collect()
    }

    pub async fn delete(&self, id: &str) -> NodeResult<bool> {
        let result = sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn clear(&self) -> NodeResult<()> {
        sqlx::query("DELETE FROM nodes").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn count(&self) -> NodeResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM nodes")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }
}

fn row_to_node(row: sqlx::sqlite::SqliteRow) -> Result<StorageNode, sqlx::Error> {
    let lat: Option<f64> = row.try_get("lat")?;
    let lng: Option<f64> = row.try_get("lng")?;
    let location = match (lat, lng) {
        (Some(lat), Some(lng)) => Some(GeoPoint::new(lat, lng)),
        _ => None,
    };
    let node_type: String = row.try_get("node_type")?;

    Ok(StorageNode {
        id: row.try_get("id")?,
        address: row.try_get("address")?,
        port: row.try_get::<i64, _>("port")? as u16,
        node_type: NodeType::from_str_or_unknown(&node_type),
        location,
        bandwidth_up: row.try_get::<i64, _>("bw_up")? as u32,
        bandwidth_down: row.try_get::<i64, _>("bw_down")? as u32,
    })
}
