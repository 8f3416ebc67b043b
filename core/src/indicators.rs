//! Indicator calculator (C4): column store, built-in kernels, and the
//! custom-indicator expression DSL.
//!
//! Grounded on `original_source/engine/utils/indicators.py` for the
//! built-in kernel formulas (EMA/SMA/RSI/ATR) and on
//! `apps/api/utils/code_validator.py` / `engine/utils/indicator_loader.py`
//! for the allow-list concept behind custom indicators. The Python
//! reference validates and `exec`s a user-supplied `(frame, params)`
//! function in a restricted namespace; Rust has no equivalent sandbox, so
//! custom indicators here are a small formula DSL (`+ - * / abs min max
//! shift sma ema` over existing columns and numeric literals), parsed by a
//! hand-written recursive-descent parser and validated before evaluation —
//! the allow-list moves from "names you may `import`" to "operators the
//! grammar accepts", which is a static property rather than a runtime scan.

use std::collections::HashMap;

use crate::bar::OhlcSeries;
use crate::error::EngineError;

/// One or more named output series produced by a kernel.
pub enum IndicatorOutput {
    Single(Vec<f64>),
    Fields(Vec<(String, Vec<f64>)>),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IndicatorSpec {
    pub id: String,
    pub kind: String,
    pub params: HashMap<String, f64>,
    pub source: Option<String>,
}

pub type CustomKernel = std::sync::Arc<dyn Fn(&ColumnStore, &HashMap<String, f64>) -> Result<IndicatorOutput, EngineError> + Send + Sync>;

/// Tabular column store aligned 1:1 with the bar series.
///
/// Seeded with `open/high/low/close/volume` on construction; indicator
/// kernels add further columns keyed by indicator id (and, for
/// multi-field kernels, `id_field`).
pub struct ColumnStore {
    len: usize,
    columns: HashMap<String, Vec<f64>>,
    custom_kernels: HashMap<String, CustomKernel>,
}

impl ColumnStore {
    pub fn new(bars: &OhlcSeries) -> Self {
        let len = bars.len();
        let mut columns = HashMap::new();
        columns.insert("open".to_string(), bars.iter().map(|b| b.open).collect());
        columns.insert("high".to_string(), bars.iter().map(|b| b.high).collect());
        columns.insert("low".to_string(), bars.iter().map(|b| b.low).collect());
        columns.insert("close".to_string(), bars.iter().map(|b| b.close).collect());
        columns.insert(
            "volume".to_string(),
            bars.iter().map(|b| b.volume).collect(),
        );
        ColumnStore {
            len,
            columns,
            custom_kernels: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(|v| v.as_slice())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Registers a kernel for a custom indicator `type`. Must be called
    /// before the first `calculate_indicator` referencing that type.
    pub fn register_custom_indicator(&mut self, kind: impl Into<String>, kernel: CustomKernel) {
        self.custom_kernels.insert(kind.into(), kernel);
    }

    /// Registers a custom indicator expressed in the formula DSL. The
    /// expression is parsed and allow-list validated immediately;
    /// evaluation is deferred to `calculate_indicator`.
    pub fn register_custom_expression(
        &mut self,
        kind: impl Into<String>,
        expression: &str,
    ) -> Result<(), EngineError> {
        let ast = dsl::parse(expression)?;
        let kind = kind.into();
        let expr_owned = expression.to_string();
        let _ = &ast; // parsed purely to validate at registration time
        self.custom_kernels.insert(
            kind,
            std::sync::Arc::new(move |store, params| {
                let ast = dsl::parse(&expr_owned)?;
                let series = dsl::eval(&ast, store, params)?;
                Ok(IndicatorOutput::Single(series))
            }),
        );
        Ok(())
    }

    /// Dispatches to a built-in kernel (`ema`, `sma`, `rsi`, `atr`) or a
    /// registered custom kernel, storing the result under `spec.id` (or
    /// `id_field` for multi-field outputs, `id` for the field `main`).
    pub fn calculate_indicator(&mut self, spec: &IndicatorSpec) -> Result<(), EngineError> {
        let output = match spec.kind.as_str() {
            "ema" => IndicatorOutput::Single(self.ema(spec)?),
            "sma" => IndicatorOutput::Single(self.sma(spec)?),
            "rsi" => IndicatorOutput::Single(self.rsi(spec)?),
            "atr" => IndicatorOutput::Single(self.atr(spec)?),
            other => {
                let kernel = self
                    .custom_kernels
                    .get(other)
                    .cloned()
                    .ok_or_else(|| EngineError::UnknownIndicator(other.to_string()))?;
                kernel(self, &spec.params)?
            }
        };
        self.store_output(spec, output)
    }

    fn store_output(
        &mut self,
        spec: &IndicatorSpec,
        output: IndicatorOutput,
    ) -> Result<(), EngineError> {
        match output {
            IndicatorOutput::Single(series) => {
                if series.len() != self.len {
                    return Err(EngineError::IndicatorKernelError(format!(
                        "indicator '{}' returned {} values, expected {}",
                        spec.id,
                        series.len(),
                        self.len
                    )));
                }
                self.columns.insert(spec.id.clone(), series);
            }
            IndicatorOutput::Fields(fields) => {
                if fields.is_empty() {
                    return Err(EngineError::IndicatorKernelError(format!(
                        "indicator '{}' returned no fields",
                        spec.id
                    )));
                }
                for (field, series) in fields {
                    if series.len() != self.len {
                        return Err(EngineError::IndicatorKernelError(format!(
                            "indicator '{}' field '{}' returned {} values, expected {}",
                            spec.id,
                            field,
                            series.len(),
                            self.len
                        )));
                    }
                    let column_name = if field == "main" {
                        spec.id.clone()
                    } else {
                        format!("{}_{}", spec.id, field)
                    };
                    self.columns.insert(column_name, series);
                }
            }
        }
        Ok(())
    }

    fn source_column(&self, spec: &IndicatorSpec) -> Result<&[f64], EngineError> {
        let name = spec.source.as_deref().unwrap_or("close");
        self.column(name).ok_or_else(|| {
            EngineError::InvalidIndicatorParams(format!(
                "indicator '{}' references unknown source column '{}'",
                spec.id, name
            ))
        })
    }

    fn period_param(&self, spec: &IndicatorSpec, default: f64) -> Result<usize, EngineError> {
        let p = spec.params.get("period").copied().unwrap_or(default);
        if p < 1.0 {
            return Err(EngineError::InvalidIndicatorParams(format!(
                "indicator '{}' period must be >= 1",
                spec.id
            )));
        }
        Ok(p as usize)
    }

    /// Exponential moving average; warmup cells are back-filled from the
    /// first computed value so downstream predicates never see a hole.
    fn ema(&self, spec: &IndicatorSpec) -> Result<Vec<f64>, EngineError> {
        let src = self.source_column(spec)?;
        let period = self.period_param(spec, 20.0)?;
        let alpha = 2.0 / (period as f64 + 1.0);
        let mut out = vec![f64::NAN; src.len()];
        let mut prev: Option<f64> = None;
        for (i, &v) in src.iter().enumerate() {
            let ema = match prev {
                None => v,
                Some(p) => alpha * v + (1.0 - alpha) * p,
            };
            out[i] = ema;
            prev = Some(ema);
        }
        back_fill(&mut out);
        Ok(out)
    }

    fn sma(&self, spec: &IndicatorSpec) -> Result<Vec<f64>, EngineError> {
        let src = self.source_column(spec)?;
        let period = self.period_param(spec, 20.0)?;
        Ok(rolling_mean(src, period))
    }

    /// Classical 14-style RSI: Wilder-smoothed average gain/loss ratio.
    fn rsi(&self, spec: &IndicatorSpec) -> Result<Vec<f64>, EngineError> {
        let src = self.source_column(spec)?;
        let period = self.period_param(spec, 14.0)?;
        let n = src.len();
        let mut out = vec![f64::NAN; n];
        if n == 0 {
            return Ok(out);
        }
        let mut avg_gain = 0.0;
        let mut avg_loss = 0.0;
        for i in 1..n {
            let change = src[i] - src[i - 1];
            let gain = change.max(0.0);
            let loss = (-change).max(0.0);
            if i <= period {
                avg_gain += gain / period as f64;
                avg_loss += loss / period as f64;
                if i == period {
                    out[i] = rsi_from_avgs(avg_gain, avg_loss);
                }
            } else {
                avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
                avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
                out[i] = rsi_from_avgs(avg_gain, avg_loss);
            }
        }
        back_fill(&mut out);
        Ok(out)
    }

    /// True range = `max(high-low, |high-prev_close|, |low-prev_close|)`,
    /// then a rolling arithmetic mean over `period` with `min_periods=1`.
    fn atr(&self, spec: &IndicatorSpec) -> Result<Vec<f64>, EngineError> {
        let high = self
            .column("high")
            .ok_or_else(|| EngineError::InvalidIndicatorParams("atr requires 'high'".into()))?;
        let low = self
            .column("low")
            .ok_or_else(|| EngineError::InvalidIndicatorParams("atr requires 'low'".into()))?;
        let close = self
            .column("close")
            .ok_or_else(|| EngineError::InvalidIndicatorParams("atr requires 'close'".into()))?;
        let period = self.period_param(spec, 14.0)?;
        let n = high.len();
        let mut tr = vec![0.0; n];
        for i in 0..n {
            let hl = high[i] - low[i];
            let tr_i = if i == 0 {
                hl
            } else {
                let hc = (high[i] - close[i - 1]).abs();
                let lc = (low[i] - close[i - 1]).abs();
                hl.max(hc).max(lc)
            };
            tr[i] = tr_i;
        }
        Ok(rolling_mean(&tr, period))
    }

    /// O(1) random access with NaN fallback: the first non-NaN value in
    /// the column, or 0.0 if the whole column is NaN.
    pub fn get_value(&self, column_name: &str, bar_index: usize) -> f64 {
        let Some(col) = self.columns.get(column_name) else {
            return 0.0;
        };
        let Some(&v) = col.get(bar_index) else {
            return 0.0;
        };
        if !v.is_nan() {
            return v;
        }
        col.iter().copied().find(|v| !v.is_nan()).unwrap_or(0.0)
    }
}

fn rsi_from_avgs(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

fn rolling_mean(src: &[f64], period: usize) -> Vec<f64> {
    let n = src.len();
    let mut out = vec![f64::NAN; n];
    let mut window_sum = 0.0;
    for i in 0..n {
        window_sum += src[i];
        let window_start = i.saturating_sub(period - 1);
        if i >= period {
            window_sum -= src[i - period];
        }
        let window_len = (i - window_start + 1) as f64;
        out[i] = window_sum / window_len;
    }
    out
}

fn back_fill(series: &mut [f64]) {
    if let Some(first_valid) = series.iter().position(|v| !v.is_nan()) {
        let fill = series[first_valid];
        for v in series.iter_mut().take(first_valid) {
            *v = fill;
        }
    }
}

/// Minimal expression DSL for custom indicators: the sandbox replacement
/// for the Python reference's restricted-namespace `exec`.
pub mod dsl {
    use super::{back_fill, rolling_mean, ColumnStore};
    use crate::error::EngineError;
    use std::collections::HashMap;

    #[derive(Debug, Clone)]
    pub enum Expr {
        Number(f64),
        Column(String),
        Unary(UnaryOp, Box<Expr>),
        Binary(BinaryOp, Box<Expr>, Box<Expr>),
        Call(Call, Vec<Expr>),
    }

    #[derive(Debug, Clone, Copy)]
    pub enum UnaryOp {
        Neg,
        Abs,
    }

    #[derive(Debug, Clone, Copy)]
    pub enum BinaryOp {
        Add,
        Sub,
        Mul,
        Div,
        Min,
        Max,
    }

    #[derive(Debug, Clone, Copy)]
    pub enum Call {
        Abs,
        Min,
        Max,
        Shift,
        Sma,
        Ema,
    }

    struct Tokenizer<'a> {
        chars: std::iter::Peekable<std::str::Chars<'a>>,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Token {
        Number(f64),
        Ident(String),
        Plus,
        Minus,
        Star,
        Slash,
        LParen,
        RParen,
        Comma,
        Eof,
    }

    impl<'a> Tokenizer<'a> {
        fn new(src: &'a str) -> Self {
            Tokenizer {
                chars: src.chars().peekable(),
            }
        }

        fn tokenize(mut self) -> Result<Vec<Token>, EngineError> {
            let mut tokens = Vec::new();
            while let Some(&c) = self.chars.peek() {
                match c {
                    ' ' | '\t' | '\n' | '\r' => {
                        self.chars.next();
                    }
                    '+' => {
                        self.chars.next();
                        tokens.push(Token::Plus);
                    }
                    '-' => {
                        self.chars.next();
                        tokens.push(Token::Minus);
                    }
                    '*' => {
                        self.chars.next();
                        tokens.push(Token::Star);
                    }
                    '/' => {
                        self.chars.next();
                        tokens.push(Token::Slash);
                    }
                    '(' => {
                        self.chars.next();
                        tokens.push(Token::LParen);
                    }
                    ')' => {
                        self.chars.next();
                        tokens.push(Token::RParen);
                    }
                    ',' => {
                        self.chars.next();
                        tokens.push(Token::Comma);
                    }
                    c if c.is_ascii_digit() || c == '.' => {
                        let mut s = String::new();
                        while let Some(&c) = self.chars.peek() {
                            if c.is_ascii_digit() || c == '.' {
                                s.push(c);
                                self.chars.next();
                            } else {
                                break;
                            }
                        }
                        let n = s.parse::<f64>().map_err(|_| {
                            EngineError::InvalidIndicatorParams(format!(
                                "invalid numeric literal '{s}' in custom indicator expression"
                            ))
                        })?;
                        tokens.push(Token::Number(n));
                    }
                    c if c.is_ascii_alphabetic() || c == '_' => {
                        let mut s = String::new();
                        while let Some(&c) = self.chars.peek() {
                            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                                s.push(c);
                                self.chars.next();
                            } else {
                                break;
                            }
                        }
                        tokens.push(Token::Ident(s));
                    }
                    other => {
                        return Err(EngineError::InvalidIndicatorParams(format!(
                            "unexpected character '{other}' in custom indicator expression"
                        )));
                    }
                }
            }
            tokens.push(Token::Eof);
            Ok(tokens)
        }
    }

    /// Operators and function names this DSL accepts. Anything outside
    /// this set fails to parse rather than being silently evaluated.
    const ALLOWED_CALLS: &[&str] = &["abs", "min", "max", "shift", "sma", "ema"];

    struct Parser {
        tokens: Vec<Token>,
        pos: usize,
    }

    impl Parser {
        fn peek(&self) -> &Token {
            &self.tokens[self.pos]
        }

        fn advance(&mut self) -> Token {
            let t = self.tokens[self.pos].clone();
            self.pos += 1;
            t
        }

        fn expect(&mut self, t: &Token) -> Result<(), EngineError> {
            if self.peek() == t {
                self.advance();
                Ok(())
            } else {
                Err(EngineError::InvalidIndicatorParams(format!(
                    "expected {t:?} in custom indicator expression, found {:?}",
                    self.peek()
                )))
            }
        }

        // expr := term (('+' | '-') term)*
        fn parse_expr(&mut self) -> Result<Expr, EngineError> {
            let mut node = self.parse_term()?;
            loop {
                match self.peek() {
                    Token::Plus => {
                        self.advance();
                        let rhs = self.parse_term()?;
                        node = Expr::Binary(BinaryOp::Add, Box::new(node), Box::new(rhs));
                    }
                    Token::Minus => {
                        self.advance();
                        let rhs = self.parse_term()?;
                        node = Expr::Binary(BinaryOp::Sub, Box::new(node), Box::new(rhs));
                    }
                    _ => break,
                }
            }
            Ok(node)
        }

        // term := factor (('*' | '/') factor)*
        fn parse_term(&mut self) -> Result<Expr, EngineError> {
            let mut node = self.parse_factor()?;
            loop {
                match self.peek() {
                    Token::Star => {
                        self.advance();
                        let rhs = self.parse_factor()?;
                        node = Expr::Binary(BinaryOp::Mul, Box::new(node), Box::new(rhs));
                    }
                    Token::Slash => {
                        self.advance();
                        let rhs = self.parse_factor()?;
                        node = Expr::Binary(BinaryOp::Div, Box::new(node), Box::new(rhs));
                    }
                    _ => break,
                }
            }
            Ok(node)
        }

        // factor := '-' factor | number | ident | ident '(' args ')' | '(' expr ')'
        fn parse_factor(&mut self) -> Result<Expr, EngineError> {
            match self.advance() {
                Token::Minus => {
                    let inner = self.parse_factor()?;
                    Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)))
                }
                Token::Number(n) => Ok(Expr::Number(n)),
                Token::LParen => {
                    let inner = self.parse_expr()?;
                    self.expect(&Token::RParen)?;
                    Ok(inner)
                }
                Token::Ident(name) => {
                    if *self.peek() == Token::LParen {
                        self.advance();
                        let mut args = Vec::new();
                        if *self.peek() != Token::RParen {
                            args.push(self.parse_expr()?);
                            while *self.peek() == Token::Comma {
                                self.advance();
                                args.push(self.parse_expr()?);
                            }
                        }
                        self.expect(&Token::RParen)?;
                        if !ALLOWED_CALLS.contains(&name.as_str()) {
                            return Err(EngineError::InvalidIndicatorParams(format!(
                                "'{name}' is not a whitelisted function in custom indicator expressions"
                            )));
                        }
                        let call = match name.as_str() {
                            "abs" => Call::Abs,
                            "min" => Call::Min,
                            "max" => Call::Max,
                            "shift" => Call::Shift,
                            "sma" => Call::Sma,
                            "ema" => Call::Ema,
                            _ => unreachable!(),
                        };
                        Ok(Expr::Call(call, args))
                    } else if name.contains('.') {
                        Err(EngineError::InvalidIndicatorParams(format!(
                            "dotted identifiers are not supported in custom indicator expressions: '{name}'"
                        )))
                    } else if name == "params" {
                        Err(EngineError::InvalidIndicatorParams(
                            "bare 'params' identifier is not supported; reference individual param names".into(),
                        ))
                    } else {
                        Ok(Expr::Column(name))
                    }
                }
                other => Err(EngineError::InvalidIndicatorParams(format!(
                    "unexpected token {other:?} in custom indicator expression"
                ))),
            }
        }
    }

    /// Parses and allow-list validates a custom-indicator expression.
    /// Only the operators in [`ALLOWED_CALLS`] and the arithmetic
    /// operators are accepted; anything else is a parse error, not a
    /// runtime failure.
    pub fn parse(src: &str) -> Result<Expr, EngineError> {
        let tokens = Tokenizer::new(src).tokenize()?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_expr()?;
        if *parser.peek() != Token::Eof {
            return Err(EngineError::InvalidIndicatorParams(format!(
                "trailing tokens after expression: {:?}",
                parser.peek()
            )));
        }
        Ok(expr)
    }

    pub fn eval(
        expr: &Expr,
        store: &ColumnStore,
        params: &HashMap<String, f64>,
    ) -> Result<Vec<f64>, EngineError> {
        let n = store.len();
        match expr {
            Expr::Number(v) => Ok(vec![*v; n]),
            Expr::Column(name) => {
                if let Some(v) = params.get(name) {
                    return Ok(vec![*v; n]);
                }
                store
                    .column(name)
                    .map(|c| c.to_vec())
                    .ok_or_else(|| EngineError::InvalidIndicatorParams(format!(
                        "unknown column or param '{name}' in custom indicator expression"
                    )))
            }
            Expr::Unary(op, inner) => {
                let v = eval(inner, store, params)?;
                Ok(match op {
                    UnaryOp::Neg => v.into_iter().map(|x| -x).collect(),
                    UnaryOp::Abs => v.into_iter().map(|x| x.abs()).collect(),
                })
            }
            Expr::Binary(op, lhs, rhs) => {
                let l = eval(lhs, store, params)?;
                let r = eval(rhs, store, params)?;
                Ok(l.into_iter()
                    .zip(r)
                    .map(|(a, b)| match op {
                        BinaryOp::Add => a + b,
                        BinaryOp::Sub => a - b,
                        BinaryOp::Mul => a * b,
                        BinaryOp::Div => {
                            if b == 0.0 {
                                f64::NAN
                            } else {
                                a / b
                            }
                        }
                        BinaryOp::Min => a.min(b),
                        BinaryOp::Max => a.max(b),
                    })
                    .collect())
            }
            Expr::Call(call, args) => eval_call(*call, args, store, params),
        }
    }

    fn eval_call(
        call: Call,
        args: &[Expr],
        store: &ColumnStore,
        params: &HashMap<String, f64>,
    ) -> Result<Vec<f64>, EngineError> {
        match call {
            Call::Abs => {
                require_arity("abs", args, 1)?;
                let v = eval(&args[0], store, params)?;
                Ok(v.into_iter().map(|x| x.abs()).collect())
            }
            Call::Min => {
                require_arity("min", args, 2)?;
                let a = eval(&args[0], store, params)?;
                let b = eval(&args[1], store, params)?;
                Ok(a.into_iter().zip(b).map(|(x, y)| x.min(y)).collect())
            }
            Call::Max => {
                require_arity("max", args, 2)?;
                let a = eval(&args[0], store, params)?;
                let b = eval(&args[1], store, params)?;
                Ok(a.into_iter().zip(b).map(|(x, y)| x.max(y)).collect())
            }
            Call::Shift => {
                require_arity("shift", args, 2)?;
                let series = eval(&args[0], store, params)?;
                let n = shift_amount(&args[1], params)?;
                Ok(shift(&series, n))
            }
            Call::Sma => {
                require_arity("sma", args, 2)?;
                let series = eval(&args[0], store, params)?;
                let period = shift_amount(&args[1], params)?.max(1) as usize;
                Ok(rolling_mean(&series, period))
            }
            Call::Ema => {
                require_arity("ema", args, 2)?;
                let series = eval(&args[0], store, params)?;
                let period = shift_amount(&args[1], params)?.max(1) as usize;
                let alpha = 2.0 / (period as f64 + 1.0);
                let mut out = vec![f64::NAN; series.len()];
                let mut prev: Option<f64> = None;
                for (i, &v) in series.iter().enumerate() {
                    let e = match prev {
                        None => v,
                        Some(p) => alpha * v + (1.0 - alpha) * p,
                    };
                    out[i] = e;
                    prev = Some(e);
                }
                back_fill(&mut out);
                Ok(out)
            }
        }
    }

    fn require_arity(name: &str, args: &[Expr], expected: usize) -> Result<(), EngineError> {
        if args.len() != expected {
            return Err(EngineError::InvalidIndicatorParams(format!(
                "'{name}' expects {expected} argument(s), got {}",
                args.len()
            )));
        }
        Ok(())
    }

    fn shift_amount(expr: &Expr, params: &HashMap<String, f64>) -> Result<i64, EngineError> {
        match expr {
            Expr::Number(n) => Ok(*n as i64),
            Expr::Column(name) => params
                .get(name)
                .map(|v| *v as i64)
                .ok_or_else(|| {
                    EngineError::InvalidIndicatorParams(format!(
                        "expected a numeric literal or param for shift/period argument, found '{name}'"
                    ))
                }),
            _ => Err(EngineError::InvalidIndicatorParams(
                "shift/period argument must be a numeric literal or param".into(),
            )),
        }
    }

    fn shift(series: &[f64], n: i64) -> Vec<f64> {
        let len = series.len();
        let mut out = vec![f64::NAN; len];
        if n >= 0 {
            let n = n as usize;
            for i in n..len {
                out[i] = series[i - n];
            }
        } else {
            let n = (-n) as usize;
            for i in 0..len.saturating_sub(n) {
                out[i] = series[i + n];
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar::Bar;

    fn series() -> OhlcSeries {
        let mut bars = Vec::new();
        for i in 0..20 {
            let c = 100.0 + i as f64;
            bars.push(Bar::new(i as i64, c, c + 1.0, c - 1.0, c, 10.0, 1).unwrap());
        }
        OhlcSeries::new(bars).unwrap()
    }

    #[test]
    fn sma_is_rolling_average() {
        let store = ColumnStore::new(&series());
        let spec = IndicatorSpec {
            id: "sma5".into(),
            kind: "sma".into(),
            params: [("period".into(), 5.0)].into_iter().collect(),
            source: Some("close".into()),
        };
        let out = store.sma(&spec).unwrap();
        assert!((out[4] - (100.0 + 101.0 + 102.0 + 103.0 + 104.0) / 5.0).abs() < 1e-9);
    }

    #[test]
    fn ema_has_no_nan_holes() {
        let store = ColumnStore::new(&series());
        let spec = IndicatorSpec {
            id: "ema5".into(),
            kind: "ema".into(),
            params: [("period".into(), 5.0)].into_iter().collect(),
            source: Some("close".into()),
        };
        let out = store.ema(&spec).unwrap();
        assert!(out.iter().all(|v| !v.is_nan()));
    }

    #[test]
    fn atr_uses_true_range() {
        let store = ColumnStore::new(&series());
        let spec = IndicatorSpec {
            id: "atr14".into(),
            kind: "atr".into(),
            params: [("period".into(), 14.0)].into_iter().collect(),
            source: None,
        };
        let out = store.atr(&spec).unwrap();
        assert!(out.iter().all(|v| *v > 0.0));
    }

    #[test]
    fn get_value_falls_back_on_nan() {
        let mut store = ColumnStore::new(&series());
        store.columns.insert("allnan".into(), vec![f64::NAN; 20]);
        assert_eq!(store.get_value("allnan", 5), 0.0);
        assert_eq!(store.get_value("missing", 0), 0.0);
    }

    #[test]
    fn unknown_indicator_type_errors() {
        let mut store = ColumnStore::new(&series());
        let spec = IndicatorSpec {
            id: "x".into(),
            kind: "not_a_real_kernel".into(),
            params: HashMap::new(),
            source: None,
        };
        assert!(matches!(
            store.calculate_indicator(&spec),
            Err(EngineError::UnknownIndicator(_))
        ));
    }

    #[test]
    fn dsl_rejects_non_whitelisted_call() {
        assert!(dsl::parse("exec(close)").is_err());
    }

    #[test]
    fn dsl_evaluates_arithmetic_over_columns() {
        let store = ColumnStore::new(&series());
        let ast = dsl::parse("high - low").unwrap();
        let out = dsl::eval(&ast, &store, &HashMap::new()).unwrap();
        assert!((out[0] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn dsl_shift_reads_prior_bar() {
        let store = ColumnStore::new(&series());
        let ast = dsl::parse("shift(close, 1)").unwrap();
        let out = dsl::eval(&ast, &store, &HashMap::new()).unwrap();
        assert!(out[0].is_nan());
        assert!((out[1] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn custom_expression_registers_and_computes() {
        let mut store = ColumnStore::new(&series());
        store
            .register_custom_expression("hl_range", "high - low")
            .unwrap();
        let spec = IndicatorSpec {
            id: "range".into(),
            kind: "hl_range".into(),
            params: HashMap::new(),
            source: None,
        };
        store.calculate_indicator(&spec).unwrap();
        assert_eq!(store.get_value("range", 0), 2.0);
    }
}
