//! Funnel and stage layout of the SprintHub CRM.
//!
//! Stage ids are unique across funnels, which is what lets the mapper derive
//! a record's funnel from its `crm_column` alone.

use std::collections::HashMap;

use thiserror::Error;

/// Built-in funnels as `(funnel id, name, [(stage id, stage name)])`, in the
/// order stages appear on the board.
const BUILTIN_FUNNELS: &[(u32, &str, &[(u32, &str)])] = &[
    (
        6,
        "Comercial",
        &[
            (130, "ENTRADA"),
            (231, "ACOLHIMENTO/TRIAGEM"),
            (82, "QUALIFICADO"),
            (207, "ORÇAMENTO REALIZADO"),
            (83, "NEGOCIAÇÃO"),
            (85, "FOLLOW UP"),
            (232, "CADASTRO PEDIDO"),
        ],
    ),
    (
        14,
        "Recompra",
        &[
            (202, "ENTRADA"),
            (228, "ACOLHIMENTO/TRIAGEM"),
            (229, "QUALIFICADO"),
            (206, "ORÇAMENTOS"),
            (203, "NEGOCIAÇÃO"),
            (204, "FOLLOW UP"),
            (230, "CADASTRO PEDIDO"),
        ],
    ),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Funnel {
    pub id: u32,
    pub name: String,
    pub stages: Vec<Stage>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("stage {stage_id} appears in both funnel {first} and funnel {second}")]
    DuplicateStage { stage_id: u32, first: u32, second: u32 },
    #[error("funnel {0} is declared twice")]
    DuplicateFunnel(u32),
}

/// Funnels with their ordered stages plus the reverse stage → funnel lookup.
#[derive(Debug, Clone)]
pub struct Topology {
    funnels: Vec<Funnel>,
    stage_to_funnel: HashMap<u32, u32>,
}

impl Topology {
    /// Build a topology, rejecting stage ids shared between funnels.
    pub fn new(funnels: Vec<Funnel>) -> Result<Self, TopologyError> {
        let mut stage_to_funnel = HashMap::new();
        let mut funnel_ids = Vec::with_capacity(funnels.len());
        for funnel in &funnels {
            if funnel_ids.contains(&funnel.id) {
                return Err(TopologyError::DuplicateFunnel(funnel.id));
            }
            funnel_ids.push(funnel.id);
            for stage in &funnel.stages {
                if let Some(first) = stage_to_funnel.insert(stage.id, funnel.id) {
                    return Err(TopologyError::DuplicateStage {
                        stage_id: stage.id,
                        first,
                        second: funnel.id,
                    });
                }
            }
        }
        Ok(Self {
            funnels,
            stage_to_funnel,
        })
    }

    /// The compiled-in SprintHub layout.
    pub fn builtin() -> Self {
        let funnels = BUILTIN_FUNNELS
            .iter()
            .map(|(id, name, stages)| Funnel {
                id: *id,
                name: (*name).to_string(),
                stages: stages
                    .iter()
                    .map(|(id, name)| Stage {
                        id: *id,
                        name: (*name).to_string(),
                    })
                    .collect(),
            })
            .collect();
        // Covered by test_builtin_topology_is_valid.
        Self::new(funnels).unwrap_or_else(|e| panic!("built-in topology is invalid: {e}"))
    }

    pub fn funnels(&self) -> &[Funnel] {
        &self.funnels
    }

    /// Funnel owning `stage_id`, or `None` for a stage we do not know about.
    pub fn funnel_for_stage(&self, stage_id: u32) -> Option<u32> {
        self.stage_to_funnel.get(&stage_id).copied()
    }

    pub fn stage_count(&self) -> usize {
        self.stage_to_funnel.len()
    }
}
