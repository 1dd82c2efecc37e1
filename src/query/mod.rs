//! Query construction, the transaction guard, federation across partitions
//! and paging of the merged result.

pub mod builder;
pub mod federator;
pub mod guard;
pub mod pager;

use crate::error::{Result, SyncdexError};
use crate::index::{IndexDefinition, IndexSchema};
use std::fmt;
use std::sync::Arc;
use tantivy::query::{Query, QueryParser, QueryParserError};
use tantivy::schema::Field;
use tantivy::tokenizer::TokenizerManager;
use tantivy::Term;

pub use builder::{QueryBuilder, QueryHandle};
pub use federator::RemoteNodes;
pub use guard::TransactionGuard;
pub use pager::PageCursor;

/// What the index schema looks like to a [`QueryProvider`].
pub struct QueryContext<'a> {
    definition: &'a IndexDefinition,
    schema: &'a IndexSchema,
    tokenizers: &'a TokenizerManager,
}

impl<'a> QueryContext<'a> {
    pub fn new(
        definition: &'a IndexDefinition,
        schema: &'a IndexSchema,
        tokenizers: &'a TokenizerManager,
    ) -> Self {
        QueryContext {
            definition,
            schema,
            tokenizers,
        }
    }

    pub fn definition(&self) -> &IndexDefinition {
        self.definition
    }

    pub fn schema(&self) -> &tantivy::schema::Schema {
        &self.schema.schema
    }

    pub fn field(&self, name: &str) -> Result<Field> {
        self.schema.field(name).ok_or_else(|| {
            SyncdexError::QueryParse(format!(
                "field '{}' is not indexed by '{}'",
                name, self.definition.name
            ))
        })
    }

    /// A term for `text` in `field`, taken verbatim (no analysis).
    pub fn term(&self, field: &str, text: &str) -> Result<Term> {
        Ok(Term::from_field_text(self.field(field)?, text))
    }

    /// A parser over this index's fields using `default_fields` for
    /// unqualified terms.
    pub fn parser(&self, default_fields: &[&str]) -> Result<QueryParser> {
        let fields = default_fields
            .iter()
            .map(|f| self.field(f))
            .collect::<Result<Vec<_>>>()?;
        Ok(QueryParser::new(
            self.schema.schema.clone(),
            fields,
            self.tokenizers.clone(),
        ))
    }
}

/// Builds a tantivy query against an index's schema.
///
/// Closures `Fn(&QueryContext) -> Result<Box<dyn Query>>` implement this.
pub trait QueryProvider: Send + Sync {
    fn build(&self, ctx: &QueryContext<'_>) -> Result<Box<dyn Query>>;
}

impl<F> QueryProvider for F
where
    F: Fn(&QueryContext<'_>) -> Result<Box<dyn Query>> + Send + Sync,
{
    fn build(&self, ctx: &QueryContext<'_>) -> Result<Box<dyn Query>> {
        self(ctx)
    }
}

/// The two ways a caller can describe a query.
#[derive(Clone)]
pub enum QuerySpec {
    Text { query: String, default_field: String },
    Provider(Arc<dyn QueryProvider>),
}

impl fmt::Debug for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuerySpec::Text {
                query,
                default_field,
            } => f
                .debug_struct("Text")
                .field("query", query)
                .field("default_field", default_field)
                .finish(),
            QuerySpec::Provider(_) => f.write_str("Provider(..)"),
        }
    }
}

impl QuerySpec {
    pub fn compile(
        &self,
        definition: &IndexDefinition,
        schema: &IndexSchema,
        tokenizers: &TokenizerManager,
    ) -> Result<Arc<dyn Query>> {
        let query = match self {
            QuerySpec::Text {
                query,
                default_field,
            } => parse_text(schema, tokenizers, query, default_field)?,
            QuerySpec::Provider(provider) => {
                provider.build(&QueryContext::new(definition, schema, tokenizers))?
            }
        };
        Ok(Arc::from(query))
    }
}

/// Parse a query string.
///
/// Terms aimed at fields the index does not have (qualified, or through a
/// default field it does not have) match nothing instead of failing, the
/// same as a field no entry ever populated. Syntax errors still fail.
pub fn parse_text(
    schema: &IndexSchema,
    tokenizers: &TokenizerManager,
    query: &str,
    default_field: &str,
) -> Result<Box<dyn Query>> {
    let defaults: Vec<Field> = schema.field(default_field).into_iter().collect();
    let parser = QueryParser::new(schema.schema.clone(), defaults, tokenizers.clone());
    match parser.parse_query(query) {
        Ok(q) => Ok(q),
        Err(QueryParserError::NoDefaultFieldDeclared)
        | Err(QueryParserError::FieldDoesNotExist(_)) => {
            let (q, errors) = parser.parse_query_lenient(query);
            if let Some(e) = errors.into_iter().find(|e| !is_unmapped_field(e)) {
                return Err(e.into());
            }
            tracing::debug!(
                "query '{}' names fields without indexed entries, unmatched terms dropped",
                query
            );
            Ok(q)
        }
        Err(e) => Err(e.into()),
    }
}

fn is_unmapped_field(e: &QueryParserError) -> bool {
    matches!(
        e,
        QueryParserError::NoDefaultFieldDeclared | QueryParserError::FieldDoesNotExist(_)
    )
}
