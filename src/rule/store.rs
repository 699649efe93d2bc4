use crate::rule::error::{RuleError, RuleResult};
use crate::rule::types::{DecisionLayer, DecisionRule, RuleContext, SharingDomain, TimeOfDay};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

/// Persistent CRUD store for decision rules: a rules table plus two child
/// tables for the per-rule mime-type set and the ordered decision layers.
#[derive(Clone)]
pub struct RuleStore {
    pool: SqlitePool,
}

impl RuleStore {
    pub async fn new(pool: SqlitePool) -> RuleResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                context TEXT NOT NULL,
                min_file_size INTEGER NOT NULL,
                sharing_domain INTEGER NOT NULL,
                is_global INTEGER NOT NULL,
                store_multiple INTEGER NOT NULL,
                replication_factor INTEGER NOT NULL,
                weekdays TEXT NOT NULL,
                start_hour INTEGER NOT NULL,
                start_minute INTEGER NOT NULL,
                end_hour INTEGER NOT NULL,
                end_minute INTEGER NOT NULL,
                context_scores TEXT NOT NULL,
                detail_score REAL NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rule_mimetypes (
                rule_id TEXT NOT NULL,
                mime TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rule_decision_layers (
                rule_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                layer TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_rule_mimetypes ON rule_mimetypes(rule_id)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Inserts a new rule. The detail score is refreshed before persisting
    /// so scoring inputs and the stored score can never diverge.
    pub async fn insert(&self, rule: &DecisionRule) -> RuleResult<()> {
        let mut rule = rule.clone();
        rule.refresh_detail_score();
        self.write_rule(&rule).await
    }

    /// Updates an existing rule (same write path: child rows are replaced).
    pub async fn update(&self, rule: &DecisionRule) -> RuleResult<()> {
        if self.get(&rule.id).await?.is_none() {
            return Err(RuleError::NotFound(rule.id.clone()));
        }
        let mut rule = rule.clone();
        rule.refresh_detail_score();
        self.write_rule(&rule).await
    }

    async fn write_rule(&self, rule: &DecisionRule) -> RuleResult<()> {
        let context_json = serde_json::to_string(&rule.context)?;
        let weekdays_json = serde_json::to_string(&rule.weekdays)?;
        let scores_json = serde_json::to_string(&rule.context_scores)?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO rules
            (id, name, created_at, context, min_file_size, sharing_domain, is_global,
             store_multiple, replication_factor, weekdays, start_hour, start_minute,
             end_hour, end_minute, context_scores, detail_score)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.name)
        .bind(rule.created_at)
        .bind(context_json)
        .bind(rule.min_file_size as i64)
        .bind(sharing_domain_to_i64(rule.sharing_domain))
        .bind(rule.is_global)
        .bind(rule.store_multiple)
        .bind(rule.replication_factor as i64)
        .bind(weekdays_json)
        .bind(rule.start_time.hour as i64)
        .bind(rule.start_time.minute as i64)
        .bind(rule.end_time.hour as i64)
        .bind(rule.end_time.minute as i64)
        .bind(scores_json)
        .bind(rule.detail_score as f64)
        .execute(&self.pool)
        .await?;

        sqlx::query("DELETE FROM rule_mimetypes WHERE rule_id = ?")
            .bind(&rule.id)
            .execute(&self.pool)
            .await?;
        for mime in &rule.mime_types {
            sqlx::query("INSERT INTO rule_mimetypes (rule_id, mime) VALUES (?, ?)")
                .bind(&rule.id)
                .bind(mime)
                .execute(&self.pool)
                .await?;
        }

        sqlx::query("DELETE FROM rule_decision_layers WHERE rule_id = ?")
            .bind(&rule.id)
            .execute(&self.pool)
            .await?;
        for (position, layer) in rule.decision_layers.iter().enumerate() {
            let layer_json = serde_json::to_string(layer)?;
            sqlx::query(
                "INSERT INTO rule_decision_layers (rule_id, position, layer) VALUES (?, ?, ?)",
            )
            .bind(&rule.id)
            .bind(position as i64)
            .bind(layer_json)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    pub async fn get(&self, id: &str) -> RuleResult<Option<DecisionRule>> {
        let row = sqlx::query("SELECT * FROM rules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    /// All rules, newest first.
    pub async fn list_all(&self) -> RuleResult<Vec<DecisionRule>> {
        let rows = sqlx::query("SELECT * FROM rules ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            rules.push(self.hydrate(row).await?);
        }
        Ok(rules)
    }

    /// Rules whose mime-type set is empty (match-all) or contains `mime`.
    /// Ordered oldest first so score ties resolve deterministically.
    pub async fn rules_matching_mime(&self, mime: &str) -> RuleResult<Vec<DecisionRule>> {
        let rows = sqlx::query(
            r#"
            SELECT r.* FROM rules r
            WHERE NOT EXISTS (SELECT 1 FROM rule_mimetypes m WHERE m.rule_id = r.id)
               OR EXISTS (SELECT 1 FROM rule_mimetypes m WHERE m.rule_id = r.id AND m.mime = ?)
            ORDER BY r.created_at ASC
            "#,
        )
        .bind(mime)
        .fetch_all(&self.pool)
        .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            rules.push(self.hydrate(row).await?);
        }
        Ok(rules)
    }

    pub async fn delete(&self, id: &str) -> RuleResult<bool> {
        sqlx::query("DELETE FROM rule_mimetypes WHERE rule_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM rule_decision_layers WHERE rule_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        let result = sqlx::query("DELETE FROM rules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn clear(&self) -> RuleResult<()> {
        sqlx::query("DELETE FROM rule_mimetypes")
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM rule_decision_layers")
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM rules").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn count(&self) -> RuleResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM rules")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }

    async fn hydrate(&self, row: sqlx::sqlite::SqliteRow) -> RuleResult<DecisionRule> {
        let id: String = row.try_get("id")?;

        let mime_rows = sqlx::query("SELECT mime FROM rule_mimetypes WHERE rule_id = ?")
            .bind(&id)
            .fetch_all(&self.pool)
            .await?;
        let mime_types = mime_rows
            .into_iter()
            .map(|r| r.try_get::<String, _>("mime"))
            .collect::<Result<Vec<_>, _>>()?;

        let layer_rows = sqlx::query(
            "SELECT layer FROM rule_decision_layers WHERE rule_id = ? ORDER BY position ASC",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?;
        let mut decision_layers = Vec::with_capacity(layer_rows.len());
        for r in layer_rows {
            let json: String = r.try_get("layer")?;
            decision_layers.push(serde_json::from_str::<DecisionLayer>(&json)?);
        }

        let context: RuleContext =
            serde_json::from_str(&row.try_get::<String, _>("context")?)?;
        let weekdays: Vec<u32> = serde_json::from_str(&row.try_get::<String, _>("weekdays")?)?;
        let context_scores: HashMap<String, f32> =
            serde_json::from_str(&row.try_get::<String, _>("context_scores")?)?;

        Ok(DecisionRule {
            id,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
            context,
            mime_types,
            decision_layers,
            min_file_size: row.try_get::<i64, _>("min_file_size")? as u64,
            sharing_domain: sharing_domain_from_i64(row.try_get("sharing_domain")?),
            is_global: row.try_get("is_global")?,
            store_multiple: row.try_get("store_multiple")?,
            replication_factor: row.try_get::<i64, _>("replication_factor")? as u32,
            weekdays,
            start_time: TimeOfDay::new(
                row.try_get::<i64, _>("start_hour")? as u32,
                row.try_get::<i64, _>("start_minute")? as u32,
            ),
            end_time: TimeOfDay::new(
                row.try_get::<i64, _>("end_hour")? as u32,
                row.try_get::<i64, _>("end_minute")? as u32,
            ),
            context_scores,
            detail_score: row.try_get::<f64, _>("detail_score")? as f32,
        })
    }
}

// The persisted encoding keeps the original tri-state convention:
// 1 = private, 0 = public, -1 = both.
fn sharing_domain_to_i64(domain: SharingDomain) -> i64 {
    match domain {
        SharingDomain::Private => 1,
        SharingDomain::Public => 0,
        SharingDomain::Both => -1,
    }
}

fn sharing_domain_from_i64(value: i64) -> SharingDomain {
    match value {
        1 => SharingDomain::Private,
        0 => SharingDomain::Public,
        _ => SharingDomain::Both,
    }
}
