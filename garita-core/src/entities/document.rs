use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use time::OffsetDateTime;
use uuid::Uuid;

/// Approved (`estatus = 3`) documents are the only ones that expire.
pub const APPROVED_DOCUMENT_STATUS: i16 = 3;

/// The columns of a `documents` row that decide its validity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentValidity {
    pub id: Uuid,
    pub estatus: i16,
    pub activo: bool,
    pub tiempo_indefinido: bool,
    pub fecha_salida: Option<OffsetDateTime>,
}

impl DocumentValidity {
    /// Mirrors the `ExpireDocuments` predicate. A missing `fecha_salida` never
    /// expires.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.estatus == APPROVED_DOCUMENT_STATUS
            && self.activo
            && !self.tiempo_indefinido
            && self.fecha_salida.is_some_and(|salida| salida <= now)
    }
}

#[derive(Debug, Clone)]
/// Deactivate approved, time-bound documents whose validity ended.
pub struct ExpireDocuments {
    pub now: OffsetDateTime,
}

impl Processor<ExpireDocuments> for DatabaseProcessor {
    type Output = u64;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ExpireDocuments")]
    async fn process(&self, query: ExpireDocuments) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET activo = FALSE
            WHERE estatus = $1
              AND activo
              AND NOT tiempo_indefinido
              AND fecha_salida <= $2
            "#,
        )
        .bind(APPROVED_DOCUMENT_STATUS)
        .bind(query.now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
