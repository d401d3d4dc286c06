//! Static table of CEI extract schemas
//!
//! Each schema names the files it applies to, the sheet to read and the
//! fixed header -> target column map. Position workbooks carry one schema
//! per sheet and share a single file pattern.

use super::product::ProductIdRule;

/// Coercion applied to a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    /// Brazilian-locale number, or a numeric cell as is
    Number,
    Integer,
    /// `DD/MM/YYYY`, or a date cell as is
    Date,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Header label as exported
    pub header: &'static str,
    pub target: &'static str,
    pub field_type: FieldType,
}

const fn field(header: &'static str, target: &'static str, field_type: FieldType) -> Field {
    Field {
        header,
        target,
        field_type,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetSelector {
    First,
    Named(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schema {
    pub name: &'static str,
    /// File name pattern with a single `*`
    pub pattern: &'static str,
    pub sheet: SheetSelector,
    pub fields: &'static [Field],
    pub product_id: ProductIdRule,
}

impl Schema {
    /// Case-insensitive match of a file name against the pattern
    pub fn matches(&self, file_name: &str) -> bool {
        let name = file_name.to_lowercase();
        match self.pattern.split_once('*') {
            Some((prefix, suffix)) => {
                name.len() >= prefix.len() + suffix.len()
                    && name.starts_with(prefix)
                    && name.ends_with(suffix)
            },
            None => name == self.pattern,
        }
    }

    pub fn targets(&self) -> impl Iterator<Item = &'static str> {
        self.fields.iter().map(|f| f.target)
    }
}

use FieldType::{Date, Integer, Number, Text};

const TRANSACTIONS: &[Field] = &[
    field("Entrada/Saída", "direction", Text),
    field("Data", "date", Date),
    field("Movimentação", "movement", Text),
    field("Produto", "product", Text),
    field("Instituição", "institution", Text),
    field("Quantidade", "quantity", Number),
    field("Preço unitário", "unit_price", Number),
    field("Valor da Operação", "amount", Number),
];

const EVENTS: &[Field] = &[
    field("Produto", "product", Text),
    field("Pagamento", "payment_date", Date),
    field("Tipo de Evento", "event_type", Text),
    field("Instituição", "institution", Text),
    field("Quantidade", "quantity", Number),
    field("Preço unitário", "unit_price", Number),
    field("Valor líquido", "net_amount", Number),
];

const TRADES: &[Field] = &[
    field("Data do Negócio", "trade_date", Date),
    field("Tipo de Movimentação", "side", Text),
    field("Mercado", "market", Text),
    field("Prazo/Vencimento", "maturity", Date),
    field("Instituição", "institution", Text),
    field("Código de Negociação", "ticker", Text),
    field("Quantidade", "quantity", Number),
    field("Preço", "price", Number),
    field("Valor", "amount", Number),
];

const POSITION_STOCKS: &[Field] = &[
    field("Produto", "product", Text),
    field("Instituição", "institution", Text),
    field("Conta", "account", Integer),
    field("Código de Negociação", "ticker", Text),
    field("CNPJ da Empresa", "company_cnpj", Text),
    field("Código ISIN / Distribuição", "isin", Text),
    field("Tipo", "type", Text),
    field("Escriturador", "registrar", Text),
    field("Quantidade", "quantity", Number),
    field("Quantidade Disponível", "available_quantity", Number),
    field("Quantidade Indisponível", "unavailable_quantity", Number),
    field("Motivo", "reason", Text),
    field("Preço de Fechamento", "closing_price", Number),
    field("Valor Atualizado", "value", Number),
];

const POSITION_BDR: &[Field] = &[
    field("Produto", "product", Text),
    field("Instituição", "institution", Text),
    field("Conta", "account", Integer),
    field("Código de Negociação", "ticker", Text),
    field("Código ISIN / Distribuição", "isin", Text),
    field("Tipo", "type", Text),
    field("Quantidade", "quantity", Number),
    field("Quantidade Disponível", "available_quantity", Number),
    field("Quantidade Indisponível", "unavailable_quantity", Number),
    field("Motivo", "reason", Text),
    field("Preço de Fechamento", "closing_price", Number),
    field("Valor Atualizado", "value", Number),
];

const POSITION_ETF: &[Field] = &[
    field("Produto", "product", Text),
    field("Instituição", "institution", Text),
    field("Conta", "account", Integer),
    field("Código de Negociação", "ticker", Text),
    field("CNPJ do Fundo", "fund_cnpj", Text),
    field("Código ISIN / Distribuição", "isin", Text),
    field("Tipo", "type", Text),
    field("Quantidade", "quantity", Number),
    field("Quantidade Disponível", "available_quantity", Number),
    field("Quantidade Indisponível", "unavailable_quantity", Number),
    field("Motivo", "reason", Text),
    field("Preço de Fechamento", "closing_price", Number),
    field("Valor Atualizado", "value", Number),
];

const POSITION_FUNDS: &[Field] = &[
    field("Produto", "product", Text),
    field("Instituição", "institution", Text),
    field("Conta", "account", Integer),
    field("Código de Negociação", "ticker", Text),
    field("CNPJ do Fundo", "fund_cnpj", Text),
    field("Código ISIN / Distribuição", "isin", Text),
    field("Tipo", "type", Text),
    field("Administrador", "administrator", Text),
    field("Quantidade", "quantity", Number),
    field("Quantidade Disponível", "available_quantity", Number),
    field("Quantidade Indisponível", "unavailable_quantity", Number),
    field("Motivo", "reason", Text),
    field("Preço de Fechamento", "closing_price", Number),
    field("Valor Atualizado", "value", Number),
];

const POSITION_FIXED_INCOME: &[Field] = &[
    field("Produto", "product", Text),
    field("Instituição", "institution", Text),
    field("Emissor", "issuer", Text),
    field("Código", "code", Text),
    field("Indexador", "indexer", Text),
    field("Tipo de regime", "regime", Text),
    field("Data de Emissão", "issue_date", Date),
    field("Vencimento", "maturity", Date),
    field("Quantidade", "quantity", Number),
    field("Quantidade Disponível", "available_quantity", Number),
    field("Quantidade Indisponível", "unavailable_quantity", Number),
    field("Motivo", "reason", Text),
    field("Contraparte", "counterparty", Text),
    field("Preço Atualizado MTM", "mtm_price", Number),
    field("Valor Atualizado MTM", "mtm_value", Number),
    field("Preço Atualizado CURVA", "curve_price", Number),
    field("Valor Atualizado CURVA", "curve_value", Number),
];

const POSITION_TREASURY: &[Field] = &[
    field("Produto", "product", Text),
    field("Instituição", "institution", Text),
    field("Código ISIN", "isin", Text),
    field("Indexador", "indexer", Text),
    field("Vencimento", "maturity", Date),
    field("Quantidade", "quantity", Number),
    field("Quantidade Disponível", "available_quantity", Number),
    field("Quantidade Indisponível", "unavailable_quantity", Number),
    field("Motivo", "reason", Text),
    field("Valor Aplicado", "invested_value", Number),
    field("Valor bruto", "gross_value", Number),
    field("Valor líquido", "net_value", Number),
    field("Valor Atualizado", "value", Number),
];

const POSITION_PATTERN: &str = "posicao-*.xlsx";

pub static SCHEMAS: &[Schema] = &[
    Schema {
        name: "transactions",
        pattern: "movimentacao-*.xlsx",
        sheet: SheetSelector::First,
        fields: TRANSACTIONS,
        product_id: ProductIdRule::LeadingCode("product"),
    },
    Schema {
        name: "events",
        pattern: "eventos-*.xlsx",
        sheet: SheetSelector::First,
        fields: EVENTS,
        product_id: ProductIdRule::LeadingCode("product"),
    },
    Schema {
        name: "trades",
        pattern: "negociacao-*.xlsx",
        sheet: SheetSelector::First,
        fields: TRADES,
        product_id: ProductIdRule::TickerColumn("ticker"),
    },
    Schema {
        name: "position-stocks",
        pattern: POSITION_PATTERN,
        sheet: SheetSelector::Named("Acoes"),
        fields: POSITION_STOCKS,
        product_id: ProductIdRule::TickerColumn("ticker"),
    },
    Schema {
        name: "position-bdr",
        pattern: POSITION_PATTERN,
        sheet: SheetSelector::Named("BDR"),
        fields: POSITION_BDR,
        product_id: ProductIdRule::TickerColumn("ticker"),
    },
    Schema {
        name: "position-etf",
        pattern: POSITION_PATTERN,
        sheet: SheetSelector::Named("ETF"),
        fields: POSITION_ETF,
        product_id: ProductIdRule::TickerColumn("ticker"),
    },
    Schema {
        name: "position-funds",
        pattern: POSITION_PATTERN,
        sheet: SheetSelector::Named("Fundo de Investimento"),
        fields: POSITION_FUNDS,
        product_id: ProductIdRule::TickerColumn("ticker"),
    },
    Schema {
        name: "position-fixed-income",
        pattern: POSITION_PATTERN,
        sheet: SheetSelector::Named("Renda Fixa"),
        fields: POSITION_FIXED_INCOME,
        product_id: ProductIdRule::WholeValue("code"),
    },
    Schema {
        name: "position-treasury",
        pattern: POSITION_PATTERN,
        sheet: SheetSelector::Named("Tesouro Direto"),
        fields: POSITION_TREASURY,
        product_id: ProductIdRule::WholeValue("product"),
    },
];

/// Schemas applying to a file, in table order
pub fn schemas_for(file_name: &str) -> Vec<&'static Schema> {
    SCHEMAS.iter().filter(|s| s.matches(file_name)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterns() {
        let names: Vec<_> = schemas_for("Negociacao-2024-01-31.xlsx").iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["trades"]);
        assert_eq!(schemas_for("posicao-2024-01-31.xlsx").len(), 6);
        assert!(schemas_for("posicao-2024-01-31.csv").is_empty());
        assert!(schemas_for("relatorio.xlsx").is_empty());
    }

    #[test]
    fn test_targets_are_unique_per_schema() {
        for schema in SCHEMAS {
            let mut targets: Vec<_> = schema.targets().collect();
            let total = targets.len();
            targets.sort_unstable();
            targets.dedup();
            assert_eq!(targets.len(), total, "duplicate target in {}", schema.name);
        }
    }

    #[test]
    fn test_product_rules_reference_real_columns() {
        for schema in SCHEMAS {
            let column = schema.product_id.column();
            assert!(schema.targets().any(|t| t == column), "{} lacks {}", schema.name, column);
        }
    }
}
