use rusqlite::{params, TransactionBehavior};
use serde_json::{Map, Value};
use tracing::debug;

use flowd_core::call::{merge_metadata, CorrelationKey, LlmCallRecord};
use flowd_core::error::Result;
use flowd_core::traits::CallRecordStore;
use flowd_core::types::{FlowId, Page, PageRequest, SortOrder};

use crate::record::{db_err, query_bodies, sql_offset, ts};
use crate::store::SqliteStore;

impl CallRecordStore for SqliteStore {
    fn insert_call_record(&self, record: &LlmCallRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO llm_calls (id, account_id, corr_key, corr_value, created_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.account_id,
                record.correlation.key,
                record.correlation.value,
                ts(&record.created_at),
                serde_json::to_string(record)?,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn enrich_call_records(
        &self,
        correlation: &CorrelationKey,
        patch: &Map<String, Value>,
    ) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let records: Vec<LlmCallRecord> = query_bodies(
            &tx,
            "SELECT body FROM llm_calls WHERE corr_key = ?1 AND corr_value = ?2 ORDER BY seq",
            params![correlation.key, correlation.value],
        )?;

        for mut record in records.iter().cloned() {
            merge_metadata(&mut record.metadata, patch);
            tx.execute(
                "UPDATE llm_calls SET body = ?2 WHERE id = ?1",
                params![record.id, serde_json::to_string(&record)?],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;

        debug!(correlation = %correlation, touched = records.len(), "Enriched LLM call records");
        Ok(records.len())
    }

    fn list_call_records(
        &self,
        account_id: &str,
        flow_id: Option<&FlowId>,
        page: PageRequest,
    ) -> Result<Page<LlmCallRecord>> {
        let conn = self.lock()?;
        let flow_id = flow_id.map(|f| f.as_str());

        let total: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM llm_calls
                 WHERE account_id = ?1
                   AND (?2 IS NULL OR json_extract(body, '$.metadata.flowId') = ?2)",
                params![account_id, flow_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;

        let dir = match page.sort() {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let sql = format!(
            "SELECT body FROM llm_calls
             WHERE account_id = ?1
               AND (?2 IS NULL OR json_extract(body, '$.metadata.flowId') = ?2)
             ORDER BY created_at {dir}, seq {dir}
             LIMIT ?3 OFFSET ?4"
        );
        let items = query_bodies(
            &conn,
            &sql,
            params![account_id, flow_id, page.page_size() as i64, sql_offset(&page)],
        )?;
        Ok(Page::new(items, total as usize, page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowd_core::call::{CallMetadata, CallOutcome};
    use serde_json::json;

    fn record(meta: &CallMetadata, model: &str, attempt: u32, ok: bool) -> LlmCallRecord {
        let outcome = if ok {
            CallOutcome::Succeeded
        } else {
            CallOutcome::Failed {
                error: "boom".into(),
            }
        };
        LlmCallRecord::new(meta, model, attempt, outcome)
    }

    #[test]
    fn enrichment_touches_only_matching_pair() {
        let store = SqliteStore::in_memory().unwrap();
        let key = CorrelationKey::new("generator", "1700000000000");
        let meta = CallMetadata::new(key.clone(), "generator").with_account("acct");
        let other = CallMetadata::new(CorrelationKey::new("generator", "1700000000001"), "generator")
            .with_account("acct");

        store.insert_call_record(&record(&meta, "a", 1, true)).unwrap();
        store.insert_call_record(&record(&meta, "b", 1, true)).unwrap();
        store.insert_call_record(&record(&other, "a", 1, true)).unwrap();

        let patch = json!({"flowId": "flow-1"}).as_object().cloned().unwrap();
        assert_eq!(store.enrich_call_records(&key, &patch).unwrap(), 2);

        let page = store
            .list_call_records("acct", None, PageRequest::default())
            .unwrap();
        assert_eq!(page.total_count, 3);
        for rec in &page.items {
            let has_flow = rec.metadata.get("flowId").is_some();
            assert_eq!(has_flow, rec.correlation == key);
            assert_eq!(rec.metadata["usecase"], "generator");
        }
    }

    #[test]
    fn enrichment_without_matches_is_zero() {
        let store = SqliteStore::in_memory().unwrap();
        let patch = json!({"flowId": "x"}).as_object().cloned().unwrap();
        let n = store
            .enrich_call_records(&CorrelationKey::new("k", "v"), &patch)
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn list_filters_by_flow_id() {
        let store = SqliteStore::in_memory().unwrap();
        let flow_meta = CallMetadata::new(CorrelationKey::new("runId", "r1"), "step")
            .with_account("acct")
            .with_extra("flowId", json!("flow-1"));
        let bare_meta = CallMetadata::new(CorrelationKey::new("runId", "r2"), "step")
            .with_account("acct");
        let foreign = CallMetadata::new(CorrelationKey::new("runId", "r3"), "step")
            .with_account("other")
            .with_extra("flowId", json!("flow-1"));

        for attempt in 1..=3 {
            store
                .insert_call_record(&record(&flow_meta, "a", attempt, attempt == 3))
                .unwrap();
        }
        store.insert_call_record(&record(&bare_meta, "a", 1, true)).unwrap();
        store.insert_call_record(&record(&foreign, "a", 1, true)).unwrap();

        let flow_id = FlowId::from_string("flow-1");
        let page = store
            .list_call_records("acct", Some(&flow_id), PageRequest::new(1, 2))
            .unwrap();
        assert_eq!(page.total_count, 3);
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.items.len(), 2);

        let asc = store
            .list_call_records(
                "acct",
                Some(&flow_id),
                PageRequest::new(1, 50).sorted(SortOrder::Asc),
            )
            .unwrap();
        assert_eq!(asc.items[0].attempt, 1);
        assert!(asc.items[2].outcome.is_success());
    }
}
