//! Applies match decisions to the fact table.

use recon_core::FactTable;
use recon_storage::{StoreError, UnitOfWork};

use crate::matcher::Decision;
use crate::tracker::OutcomeKind;

#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub outcome: OutcomeKind,
    pub fact_id: i64,
    pub changed_fields: Vec<&'static str>,
}

/// Applies one matcher decision. `Unchanged` does not touch the store.
pub async fn execute(
    uow: &mut dyn UnitOfWork,
    table: &FactTable,
    decision: Decision,
) -> Result<Applied, StoreError> {
    match decision {
        Decision::Insert { columns } => {
            let fact_id = uow.insert_fact(table, &columns).await?;
            Ok(Applied {
                outcome: OutcomeKind::New,
                fact_id,
                changed_fields: Vec::new(),
            })
        }
        Decision::Patch {
            id,
            diff,
            changed_fields,
        } => {
            uow.patch_fact(table, id, &diff).await?;
            Ok(Applied {
                outcome: OutcomeKind::Updated,
                fact_id: id,
                changed_fields,
            })
        }
        Decision::Unchanged { id } => Ok(Applied {
            outcome: OutcomeKind::Unchanged,
            fact_id: id,
            changed_fields: Vec::new(),
        }),
    }
}
