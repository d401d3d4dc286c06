//! Product identifier extraction rules

use custodia_common::{Dataset, Value};

/// How a schema derives `product_id` from one of its target columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductIdRule {
    /// Ticker with the fractional-market `F` suffix removed (`PETR4F` -> `PETR4`)
    TickerColumn(&'static str),
    /// Code before ` - ` (`PETR4 - PETROLEO BRASILEIRO` -> `PETR4`)
    LeadingCode(&'static str),
    /// The trimmed value itself
    WholeValue(&'static str),
}

impl ProductIdRule {
    pub fn column(&self) -> &'static str {
        match self {
            ProductIdRule::TickerColumn(c)
            | ProductIdRule::LeadingCode(c)
            | ProductIdRule::WholeValue(c) => c,
        }
    }

    pub fn extract(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let id = match self {
            ProductIdRule::TickerColumn(_) => strip_fractional(raw),
            ProductIdRule::LeadingCode(_) => raw.split(" - ").next().unwrap_or(raw).trim(),
            ProductIdRule::WholeValue(_) => raw,
        };
        (!id.is_empty()).then(|| id.to_string())
    }

    /// Append a `product_id` column computed from the rule's column
    pub fn apply(&self, dataset: &mut Dataset) {
        let idx = dataset.column_index(self.column());
        dataset.add_column_with("product_id", |row| {
            idx.and_then(|i| row[i].as_text())
                .and_then(|text| self.extract(text))
                .map_or(Value::Null, Value::Text)
        });
    }
}

/// Tickers end in a digit; a trailing `F` after it marks the odd-lot market
fn strip_fractional(ticker: &str) -> &str {
    match ticker.strip_suffix('F').or_else(|| ticker.strip_suffix('f')) {
        Some(base) if base.ends_with(|c: char| c.is_ascii_digit()) => base,
        _ => ticker,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticker_rule() {
        let rule = ProductIdRule::TickerColumn("ticker");
        assert_eq!(rule.extract("PETR4F"), Some("PETR4".into()));
        assert_eq!(rule.extract("BOVA11"), Some("BOVA11".into()));
        assert_eq!(rule.extract("TAEF"), Some("TAEF".into()));
        assert_eq!(rule.extract("  "), None);
    }

    #[test]
    fn test_leading_code_rule() {
        let rule = ProductIdRule::LeadingCode("product");
        assert_eq!(rule.extract("ITSA4 - ITAUSA S/A"), Some("ITSA4".into()));
        assert_eq!(rule.extract("Tesouro Selic 2029"), Some("Tesouro Selic 2029".into()));
    }

    #[test]
    fn test_apply_adds_column() {
        let mut ds = Dataset::new(vec!["product".into()]);
        ds.push_row(vec![Value::text("BBAS3 - BANCO DO BRASIL")]);
        ds.push_row(vec![Value::Null]);
        ProductIdRule::LeadingCode("product").apply(&mut ds);

        assert_eq!(ds.value(0, "product_id"), Some(&Value::text("BBAS3")));
        assert_eq!(ds.value(1, "product_id"), Some(&Value::Null));
    }
}
