use crate::identity::IdentityMatcher;
use crate::schema::{require_column, SchemaError, SchemaResolver};
use crate::{IdentityConfig, ProcessingConfig};
use casebook_core::{
    Appended, CellRange, CompletionFailureKind, CompletionGuardrails, CompletionRequest,
    CompletionService, HostError, KeyValueState, Outcome, OutputRecord, RowErrorKind,
    SchemaSnapshot, TabularStore, WorkItem, FIRST_DATA_ROW,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, warn};

/// Converts one input row into one new output row. Row-level failures come
/// back as [`Outcome::Error`]; only schema failures are returned as errors.
pub struct RowProcessor<'a> {
    store: &'a dyn TabularStore,
    state: &'a dyn KeyValueState,
    service: &'a dyn CompletionService,
    identity: &'a IdentityConfig,
    processing: &'a ProcessingConfig,
}

impl<'a> RowProcessor<'a> {
    pub fn new(
        store: &'a dyn TabularStore,
        state: &'a dyn KeyValueState,
        service: &'a dyn CompletionService,
        identity: &'a IdentityConfig,
        processing: &'a ProcessingConfig,
    ) -> Self {
        Self {
            store,
            state,
            service,
            identity,
            processing,
        }
    }

    pub fn process_one(
        &self,
        input_sheet: &str,
        output_sheet: &str,
        item: &WorkItem,
    ) -> Result<Outcome, SchemaError> {
        let resolver = SchemaResolver::new(self.store, self.state);
        let input_schema = resolver.refresh(input_sheet)?;
        let output_schema = resolver.refresh(output_sheet)?;
        require_column(&input_schema, self.identity.input_primary())?;
        let key_column = require_column(&output_schema, &self.identity.primary_field)?;

        let input_fields = match self.read_input_row(input_sheet, &input_schema, item.source_row) {
            Ok(Some(fields)) => fields,
            Ok(None) => {
                return Ok(Outcome::skipped(format!(
                    "input row {} no longer exists",
                    item.source_row
                )))
            }
            Err(err) => return Ok(store_error("read input row", &err)),
        };

        match input_fields.get(self.identity.input_primary()) {
            None => {
                return Ok(Outcome::skipped(format!(
                    "input row {} has no primary key",
                    item.source_row
                )))
            }
            Some(current) if current != &item.primary_key => {
                return Ok(Outcome::skipped(format!(
                    "input row {} key changed from {} to {current}",
                    item.source_row, item.primary_key
                )))
            }
            Some(_) => {}
        }

        if let Some(outcome) = self.existing_output(&output_schema, item)? {
            return Ok(outcome);
        }

        let request = self.build_request(input_sheet, item, input_fields, &output_schema);
        let guardrails = CompletionGuardrails {
            timeout_ms: self.processing.timeout_ms,
        };
        let started = Instant::now();
        let result = self.service.complete(&request, &guardrails);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let output = match result {
            Ok(_) if elapsed_ms > guardrails.timeout_ms => {
                return Ok(Outcome::error(
                    RowErrorKind::Timeout,
                    format!(
                        "{} answered after {elapsed_ms}ms, limit {}ms",
                        self.service.service_name(),
                        guardrails.timeout_ms
                    ),
                ))
            }
            Ok(output) => output,
            Err(err) => {
                let kind = match err.kind {
                    CompletionFailureKind::Timeout => RowErrorKind::Timeout,
                    _ => RowErrorKind::Service,
                };
                return Ok(Outcome::error(kind, err.to_string()));
            }
        };
        debug!(
            event = "completion_returned",
            service = self.service.service_name(),
            row = item.source_row,
            elapsed_ms,
            fields = output.fields.len()
        );

        let mut fields = BTreeMap::new();
        for (name, value) in &output.fields {
            let name = name.trim();
            if !request.target_fields.iter().any(|target| target == name) {
                debug!(event = "completion_field_ignored", field = %name);
                continue;
            }
            if let Some(rendered) = render_value(value) {
                fields.insert(name.to_string(), rendered);
            }
        }

        let missing = request
            .required_fields
            .iter()
            .filter(|name| !fields.contains_key(name.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Ok(Outcome::error(
                RowErrorKind::Validation,
                format!("missing required fields: {}", missing.join(", ")),
            ));
        }

        for (name, default) in &self.processing.defaults {
            if output_schema.contains(name) && !fields.contains_key(name) {
                fields.insert(name.clone(), default.clone());
            }
        }

        fields.insert(self.identity.primary_field.clone(), item.primary_key.clone());
        if let (Some(field), Some(key)) = (
            self.identity.secondary_field.as_ref(),
            item.secondary_key.as_ref(),
        ) {
            if output_schema.contains(field) {
                fields.insert(field.clone(), key.clone());
            }
        }

        // Another job may have written the key while the service was busy.
        let row = match self.append_row(output_sheet, &output_schema, key_column, item, &fields) {
            Ok(Appended::Written(row)) => row,
            Ok(Appended::KeyExists(existing)) => {
                return Ok(Outcome::Duplicate {
                    primary_key: item.primary_key.clone(),
                    existing_row: Some(existing),
                })
            }
            Err(err) => return Ok(store_error("write output row", &err)),
        };

        Ok(Outcome::Created {
            row,
            record: OutputRecord {
                primary_key: item.primary_key.clone(),
                secondary_key: item.secondary_key.clone(),
                fields,
            },
        })
    }

    /// Non-empty cells of the source row keyed by logical name, or `None`
    /// when the row is past the end of the sheet.
    fn read_input_row(
        &self,
        sheet: &str,
        schema: &SchemaSnapshot,
        row: u32,
    ) -> Result<Option<BTreeMap<String, String>>, HostError> {
        if row > self.store.last_row(sheet)? {
            return Ok(None);
        }
        let cells = self
            .store
            .get_range(sheet, CellRange::new(row, 1, 1, schema.max_column()))?
            .into_iter()
            .next()
            .unwrap_or_default();

        Ok(Some(
            schema
                .fields
                .iter()
                .filter_map(|field| {
                    let value = cells.get(field.column as usize - 1)?.trim();
                    (!value.is_empty()).then(|| (field.logical_name.clone(), value.to_string()))
                })
                .collect(),
        ))
    }

    fn existing_output(
        &self,
        schema: &SchemaSnapshot,
        item: &WorkItem,
    ) -> Result<Option<Outcome>, SchemaError> {
        let matcher = match IdentityMatcher::load(
            self.store,
            schema,
            &self.identity.primary_field,
            self.identity.secondary_field.as_deref(),
            self.identity.lookup_order,
        ) {
            Ok(matcher) => matcher,
            Err(SchemaError::Host(err)) => return Ok(Some(store_error("read output keys", &err))),
            Err(err) => return Err(err),
        };

        Ok(matcher
            .find_row(&item.primary_key)
            .map(|row| Outcome::Duplicate {
                primary_key: item.primary_key.clone(),
                existing_row: Some(row),
            }))
    }

    fn build_request(
        &self,
        input_sheet: &str,
        item: &WorkItem,
        input_fields: BTreeMap<String, String>,
        output_schema: &SchemaSnapshot,
    ) -> CompletionRequest {
        let target_fields = output_schema
            .logical_names()
            .filter(|name| !self.identity.is_key_field(name))
            .map(str::to_string)
            .collect::<Vec<_>>();

        let mut required_fields = Vec::new();
        for name in &self.processing.required_fields {
            if self.identity.is_key_field(name) {
                continue;
            }
            if output_schema.contains(name) {
                required_fields.push(name.clone());
            } else {
                warn!(
                    event = "required_field_unmapped",
                    sheet = %output_schema.sheet,
                    field = %name,
                    "required field has no output column; not enforced"
                );
            }
        }

        CompletionRequest {
            prompt_version: self.processing.prompt_version.clone(),
            source_sheet: input_sheet.to_string(),
            source_row: item.source_row,
            primary_key: item.primary_key.clone(),
            secondary_key: item.secondary_key.clone(),
            input_fields,
            target_fields,
            required_fields,
        }
    }

    fn append_row(
        &self,
        sheet: &str,
        schema: &SchemaSnapshot,
        key_column: u32,
        item: &WorkItem,
        fields: &BTreeMap<String, String>,
    ) -> Result<Appended, HostError> {
        let mut values = vec![String::new(); schema.max_column() as usize];
        for field in &schema.fields {
            if let Some(value) = fields.get(&field.logical_name) {
                values[field.column as usize - 1] = value.clone();
            }
        }
        self.store.append_row_if_absent(
            sheet,
            FIRST_DATA_ROW,
            key_column,
            &item.primary_key,
            &values,
        )
    }
}

fn store_error(action: &str, err: &HostError) -> Outcome {
    Outcome::error(RowErrorKind::Store, format!("{action}: {err}"))
}

/// Cell text for one model value. Null and blank strings count as absent;
/// zero and false are real values.
pub fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => {
            let text = text.trim();
            (!text.is_empty()).then(|| text.to_string())
        }
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        other => Some(other.to_string()),
    }
}
