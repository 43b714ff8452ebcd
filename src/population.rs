//! Views over the evolutionary population.
//!
//! Generations, agents and decisions are written by the evolution engine
//! through the persistence layer; this module assembles the read side the
//! dashboard serves: per-generation detail with fitness summary, decision
//! tallies and hourly activity.

use serde::Serialize;

use crate::persistence::{
    AgentRecord, Database, DbError, DbResult, DecisionTally, FitnessSummary, GenerationRecord,
    HourBucket, NewDecision,
};
use crate::types::{OrderSource, Side, TradeRequest};

/// Everything the dashboard shows for one generation.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationDetail {
    pub generation: GenerationRecord,
    pub agents: Vec<AgentRecord>,
    pub fitness: FitnessSummary,
    pub tallies: Vec<DecisionTally>,
    pub hourly: Vec<HourBucket>,
}

/// Load the full detail view for one generation.
pub fn generation_detail(db: &Database, generation_id: i64) -> DbResult<GenerationDetail> {
    let generation = db
        .get_generations()?
        .into_iter()
        .find(|g| g.id == generation_id)
        .ok_or_else(|| DbError::NotFound(format!("Generation not found: {}", generation_id)))?;

    Ok(GenerationDetail {
        agents: db.get_agents(generation_id)?,
        fitness: db.fitness_summary(generation_id)?,
        tallies: db.decision_tallies(generation_id)?,
        hourly: db.hourly_decision_counts(generation_id)?,
        generation,
    })
}

/// Persist an agent decision and, for buy/sell actions, turn it into a
/// trade request for the executor. Hold decisions only count toward the
/// tallies.
pub fn record_agent_decision(
    db: &Database,
    decision: &NewDecision,
    quantity: f64,
) -> DbResult<Option<TradeRequest>> {
    db.insert_decision(decision)?;

    let side = match decision.action.as_str() {
        "buy" => Side::Buy,
        "sell" => Side::Sell,
        _ => return Ok(None),
    };

    Ok(Some(TradeRequest {
        symbol: decision.symbol.clone(),
        side,
        quantity,
        limit_price: None,
        source: OrderSource::Agent,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_db() -> (Database, i64, i64) {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();

        let gen_id = db.insert_generation("gen-7", 3).unwrap();
        db.upsert_agent(gen_id, "a0", "h0", 3.0, 5, 2, "alive").unwrap();
        db.upsert_agent(gen_id, "a1", "h1", 1.0, 1, 6, "culled").unwrap();
        let agent_id = db.get_agents(gen_id).unwrap()[0].id;
        (db, gen_id, agent_id)
    }

    #[test]
    fn test_generation_detail() {
        let (db, gen_id, agent_id) = seeded_db();

        for action in ["buy", "hold", "hold"] {
            db.insert_decision(&NewDecision {
                agent_id,
                generation_id: gen_id,
                symbol: "BTC-USD".to_string(),
                action: action.to_string(),
            })
            .unwrap();
        }

        let detail = generation_detail(&db, gen_id).unwrap();
        assert_eq!(detail.generation.label, "gen-7");
        assert_eq!(detail.agents.len(), 2);
        assert_eq!(detail.fitness.best_fitness, Some(3.0));
        assert_eq!(detail.tallies.len(), 2);
        assert_eq!(detail.hourly.len(), 1);
        assert_eq!(detail.hourly[0].cumulative, 3);
    }

    #[test]
    fn test_missing_generation_is_not_found() {
        let (db, _, _) = seeded_db();
        assert!(matches!(
            generation_detail(&db, 999),
            Err(DbError::NotFound(_))
        ));
    }

    #[test]
    fn test_buy_decision_becomes_trade_request() {
        let (db, gen_id, agent_id) = seeded_db();

        let request = record_agent_decision(
            &db,
            &NewDecision {
                agent_id,
                generation_id: gen_id,
                symbol: "BTC-USD".to_string(),
                action: "buy".to_string(),
            },
            0.5,
        )
        .unwrap()
        .unwrap();

        assert_eq!(request.side, Side::Buy);
        assert_eq!(request.source, OrderSource::Agent);
        assert_eq!(request.quantity, 0.5);
    }

    #[test]
    fn test_hold_decision_is_tally_only() {
        let (db, gen_id, agent_id) = seeded_db();

        let request = record_agent_decision(
            &db,
            &NewDecision {
                agent_id,
                generation_id: gen_id,
                symbol: "BTC-USD".to_string(),
                action: "hold".to_string(),
            },
            0.5,
        )
        .unwrap();

        assert!(request.is_none());
        assert_eq!(db.decision_tallies(gen_id).unwrap()[0].action, "hold");
    }
}
