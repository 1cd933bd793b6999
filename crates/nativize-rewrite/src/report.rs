//! Rewrite report listing every rewritten stub.

use std::fmt;

use serde::Serialize;

use crate::marshal::MarshallingPlan;
use crate::plan::{TransformationRecord, TypePlan};

/// One parameter or return slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotReport {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub plan: MarshallingPlan,
}

/// One rewritten stub.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StubReport {
    /// `Namespace.Type::Name`
    pub method: String,
    pub library: String,
    /// Name handed to the loader, after aliasing.
    pub load_name: String,
    pub symbol: String,
    pub convention: String,
    pub params: Vec<SlotReport>,
    pub returns: SlotReport,
}

impl StubReport {
    pub fn from_record(record: &TransformationRecord) -> Self {
        let function = &record.function;
        Self {
            method: function.qualified_name(),
            library: function.library.clone(),
            load_name: record.library.load_name.clone(),
            symbol: function.symbol.clone(),
            convention: record.call_site.convention.to_string(),
            params: function
                .params
                .iter()
                .map(|p| SlotReport {
                    name: p.name.clone(),
                    ty: p.ty.to_string(),
                    plan: p.plan,
                })
                .collect(),
            returns: SlotReport {
                name: "return".to_string(),
                ty: function.return_slot.ty.to_string(),
                plan: function.return_slot.plan,
            },
        }
    }
}

/// Summary of one rewrite run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RewriteReport {
    pub module: String,
    /// Full name of the generated helper type.
    pub helper_type: String,
    pub duration_ms: u64,
    /// Nothing to rewrite; the module was returned as is.
    pub unchanged: bool,
    /// Declaring types that received generated members.
    pub types: Vec<String>,
    /// Distinct (declaring type, library) pairs.
    pub library_cells: usize,
    pub stubs: Vec<StubReport>,
    pub warnings: Vec<String>,
}

impl RewriteReport {
    pub fn new(module: &str, helper_type: &str) -> Self {
        Self {
            module: module.to_string(),
            helper_type: helper_type.to_string(),
            duration_ms: 0,
            unchanged: true,
            types: Vec::new(),
            library_cells: 0,
            stubs: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn record_type(&mut self, plan: &TypePlan) {
        self.unchanged = false;
        self.types.push(plan.declaring_type.to_string());
        self.library_cells += plan.libraries.len();
        self.stubs
            .extend(plan.records.iter().map(StubReport::from_record));
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for RewriteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Rewrite Report ===")?;
        writeln!(f, "Module: {}", self.module)?;
        writeln!(f, "Duration: {} ms", self.duration_ms)?;

        if self.unchanged {
            writeln!(f, "No import stubs to rewrite; module unchanged.")?;
            return Ok(());
        }

        writeln!(f, "Helper type: {}", self.helper_type)?;
        writeln!(
            f,
            "Rewritten: {} stubs in {} types ({} library cells)",
            self.stubs.len(),
            self.types.len(),
            self.library_cells
        )?;

        writeln!(f)?;
        writeln!(f, "--- Stubs ---")?;
        for stub in &self.stubs {
            let params: Vec<String> = stub
                .params
                .iter()
                .map(|p| format!("{}: {} [{}]", p.name, p.ty, p.plan))
                .collect();
            writeln!(
                f,
                "  {}({}) -> {} [{}]",
                stub.method,
                params.join(", "),
                stub.returns.ty,
                stub.returns.plan
            )?;
            if stub.load_name == stub.library {
                writeln!(f, "    {}!{} ({})", stub.library, stub.symbol, stub.convention)?;
            } else {
                writeln!(
                    f,
                    "    {} as {}!{} ({})",
                    stub.library, stub.load_name, stub.symbol, stub.convention
                )?;
            }
        }

        if !self.warnings.is_empty() {
            writeln!(f)?;
            writeln!(f, "--- Warnings ({}) ---", self.warnings.len())?;
            for warning in &self.warnings {
                writeln!(f, "  {warning}")?;
            }
        }

        Ok(())
    }
}
