//! Image writer
//!
//! Two passes, the same shape as the live network: assign indices by
//! walking the structures in canonical order, then write each section as
//! a byte size followed by its record array.

use crate::records::{
    index_of, BsaveDefrule, BsaveFactPatternNode, BsaveJoinLink, BsaveJoinNode,
    BsavePatternNodeHeader, FieldWriter, ImageResult, IMAGE_MAGIC, IMAGE_VERSION, NULL_INDEX,
};
use match_model::{PatternNodeId, SelectorKey, Value};
use rete::beta::{Direction, JoinLink, RightEntry};
use rete::expr::{Expr, Operand, TestOp};
use rete::Engine;
use std::io::Write;
use tracing::debug;

/// Serialize the compiled network to a stream.
pub fn save_image<W: Write>(engine: &Engine, out: W) -> ImageResult<()> {
    let mut w = FieldWriter::new(out);

    w.put_u8(IMAGE_MAGIC[0])?;
    w.put_u8(IMAGE_MAGIC[1])?;
    w.put_u8(IMAGE_MAGIC[2])?;
    w.put_u8(IMAGE_MAGIC[3])?;
    w.put_u32(IMAGE_VERSION)?;

    // Pattern nodes are imaged in canonical traversal order.
    let templates = engine.patterns().templates();
    let mut node_order: Vec<PatternNodeId> = Vec::new();
    for template in &templates {
        node_order.extend(engine.patterns().traversal(*template));
    }
    let mut node_index = vec![NULL_INDEX; engine.patterns().node_count()];
    for (i, id) in node_order.iter().enumerate() {
        node_index[id.index()] = i as u64;
    }
    let map_node = |id: Option<PatternNodeId>| -> u64 {
        index_of(id.map(|n| node_index[n.index()]))
    };

    // Join links flatten into one chained table: per-join chains first,
    // then the three prime chains.
    let mut link_table: Vec<BsaveJoinLink> = Vec::new();
    let mut first_links: Vec<u64> = Vec::new();
    for (_, join) in engine.joins().iter() {
        first_links.push(chain_links(&join.next_links, &mut link_table));
    }
    let right_prime_index = chain_links(&engine.joins().right_prime, &mut link_table);
    let left_prime_index = chain_links(&engine.joins().left_prime, &mut link_table);
    let goal_prime_index = chain_links(&engine.joins().goal_prime, &mut link_table);

    // Fixed-order counts header.
    w.put_u64(1)?; // modules
    w.put_u64(engine.rules().len() as u64)?;
    w.put_u64(engine.joins().len() as u64)?;
    w.put_u64(link_table.len() as u64)?;
    w.put_u64(right_prime_index)?;
    w.put_u64(left_prime_index)?;
    w.put_u64(goal_prime_index)?;

    // Expression table.
    w.put_u64(engine.expressions().len() as u64)?;
    for (_, expr) in engine.expressions().iter() {
        write_expr(&mut w, expr)?;
    }

    // Template roots.
    w.put_u64(templates.len() as u64)?;
    for template in &templates {
        w.put_u32(template.0)?;
        w.put_u64(map_node(engine.patterns().root(*template)))?;
    }

    // Pattern node records.
    w.put_u64(node_order.len() as u64 * BsaveFactPatternNode::WIDTH)?;
    for id in &node_order {
        let node = match engine.patterns().node(*id) {
            Some(n) => n,
            None => continue,
        };
        let mut flags = 0u16;
        for (bit, set) in [
            node.flags.singlefield,
            node.flags.multifield,
            node.flags.stop,
            false, // blocked
            false, // initialize
            false, // marked
            node.flags.begin_slot,
            node.flags.end_slot,
            node.flags.selector,
        ]
        .iter()
        .enumerate()
        {
            if *set {
                flags |= 1 << bit;
            }
        }
        let record = BsaveFactPatternNode {
            header: BsavePatternNodeHeader {
                entry_join: index_of(node.entry_join.map(|j| j.0 as u64)),
                right_hash: index_of(node.right_hash.map(|t| t.0 as u64)),
                flags,
            },
            which_slot: node.which_slot.0,
            which_field: node.which_field,
            leave_fields: node.leave_fields,
            network_test: index_of(node.network_test.map(|t| t.0 as u64)),
            next_level: map_node(node.next_level),
            last_level: map_node(node.last_level),
            left_node: map_node(node.left_node),
            right_node: map_node(node.right_node),
            modify_slots: node.modify_slots,
        };
        record.write(&mut w)?;
    }

    // Selector dispatch entries.
    let selector_entries = engine.patterns().selector_entries();
    w.put_u64(selector_entries.len() as u64)?;
    for (parent, key, child) in selector_entries {
        w.put_u64(node_index[parent.index()])?;
        write_selector_key(&mut w, &key)?;
        w.put_u64(node_index[child.index()])?;
    }

    // Join records, in arena order.
    w.put_u64(engine.joins().len() as u64 * BsaveJoinNode::WIDTH)?;
    for (id, join) in engine.joins().iter() {
        let mut flags_depth = 0u32;
        for (bit, set) in [
            join.flags.first_join,
            join.flags.logical_join,
            join.flags.goal_join,
            join.flags.explicit_join,
            join.flags.join_from_the_right,
            join.flags.pattern_is_negated,
            join.flags.pattern_is_exists,
        ]
        .iter()
        .enumerate()
        {
            if *set {
                flags_depth |= 1 << bit;
            }
        }
        flags_depth |= (join.rhs_type as u32 & 0b111) << 7;
        flags_depth |= (join.depth as u32 & 0x7f) << 10;

        let record = BsaveJoinNode {
            flags_depth,
            network_test: index_of(join.network_test.map(|t| t.0 as u64)),
            secondary_network_test: index_of(join.secondary_network_test.map(|t| t.0 as u64)),
            goal_expression: index_of(join.goal_expression.map(|t| t.0 as u64)),
            left_hash: index_of(join.left_hash.map(|t| t.0 as u64)),
            right_hash: index_of(join.right_hash.map(|t| t.0 as u64)),
            right_side_entry_structure: match join.right_side_entry {
                Some(RightEntry::Pattern(node)) => node_index[node.index()],
                Some(RightEntry::Join(j)) => j.0 as u64,
                None => NULL_INDEX,
            },
            next_links: first_links[id.index()],
            last_level: index_of(join.last_level.map(|j| j.0 as u64)),
            right_match_node: index_of(join.right_match_node.map(|j| j.0 as u64)),
            rule_to_activate: index_of(join.rule_to_activate.map(|r| r.0 as u64)),
        };
        record.write(&mut w)?;
    }

    // Link records.
    w.put_u64(link_table.len() as u64 * BsaveJoinLink::WIDTH)?;
    for link in &link_table {
        link.write(&mut w)?;
    }

    // Rule names, then fixed-width rule records.
    w.put_u64(engine.rules().len() as u64)?;
    for rule in engine.rules() {
        w.put_str(&rule.name)?;
    }
    w.put_u64(engine.rules().len() as u64 * BsaveDefrule::WIDTH)?;
    for (i, rule) in engine.rules().iter().enumerate() {
        let mut complexity_flags = rule.complexity & 0x0fff;
        if rule.auto_focus {
            complexity_flags |= 1 << 12;
        }
        let record = BsaveDefrule {
            name: i as u32,
            salience: rule.salience,
            local_var_cnt: rule.local_var_cnt,
            complexity_flags,
            certainty: rule.certainty,
            dynamic_salience: NULL_INDEX,
            actions: NULL_INDEX,
            logical_join: index_of(rule.logical_join.map(|j| j.0 as u64)),
            last_join: index_of(rule.last_join.map(|j| j.0 as u64)),
            disjunct: index_of(rule.disjunct.map(|r| r.0 as u64)),
        };
        record.write(&mut w)?;
    }

    debug!(
        nodes = node_order.len(),
        joins = engine.joins().len(),
        links = link_table.len(),
        rules = engine.rules().len(),
        "network image written"
    );
    Ok(())
}

fn chain_links(links: &[JoinLink], table: &mut Vec<BsaveJoinLink>) -> u64 {
    if links.is_empty() {
        return NULL_INDEX;
    }
    let start = table.len() as u64;
    for (i, link) in links.iter().enumerate() {
        let next = if i + 1 == links.len() {
            NULL_INDEX
        } else {
            start + i as u64 + 1
        };
        table.push(BsaveJoinLink {
            enter_direction: match link.enter_direction {
                Direction::Lhs => b'L',
                Direction::Rhs => b'R',
            },
            join: link.join.0 as u64,
            next,
        });
    }
    start
}

pub(crate) fn write_value<W: Write>(w: &mut FieldWriter<W>, value: &Value) -> ImageResult<()> {
    match value {
        Value::Symbol(s) => {
            w.put_u8(0)?;
            w.put_str(s)
        }
        Value::Integer(i) => {
            w.put_u8(1)?;
            w.put_i64(*i)
        }
        Value::Float(f) => {
            w.put_u8(2)?;
            w.put_u64(f.to_bits())
        }
        Value::Multifield(values) => {
            w.put_u8(3)?;
            w.put_u32(values.len() as u32)?;
            for v in values {
                write_value(w, v)?;
            }
            Ok(())
        }
    }
}

fn write_operand<W: Write>(w: &mut FieldWriter<W>, operand: &Operand) -> ImageResult<()> {
    match operand {
        Operand::Const(value) => {
            w.put_u8(0)?;
            write_value(w, value)
        }
        Operand::Lhs { depth, slot } => {
            w.put_u8(1)?;
            w.put_u16(*depth)?;
            w.put_u16(slot.0)
        }
        Operand::Rhs { slot } => {
            w.put_u8(2)?;
            w.put_u16(slot.0)
        }
        Operand::LhsSpan { depth, marker } => {
            w.put_u8(3)?;
            w.put_u16(*depth)?;
            w.put_u16(*marker)
        }
        Operand::RhsSpan { marker } => {
            w.put_u8(4)?;
            w.put_u16(*marker)
        }
    }
}

fn op_tag(op: TestOp) -> u8 {
    match op {
        TestOp::Eq => 0,
        TestOp::Ne => 1,
        TestOp::Lt => 2,
        TestOp::Le => 3,
        TestOp::Gt => 4,
        TestOp::Ge => 5,
    }
}

fn write_expr<W: Write>(w: &mut FieldWriter<W>, expr: &Expr) -> ImageResult<()> {
    match expr {
        Expr::True => w.put_u8(0),
        Expr::Cmp { op, left, right } => {
            w.put_u8(1)?;
            w.put_u8(op_tag(*op))?;
            write_operand(w, left)?;
            write_operand(w, right)
        }
        Expr::All(parts) => {
            w.put_u8(2)?;
            w.put_u32(parts.len() as u32)?;
            for part in parts {
                w.put_u64(part.0 as u64)?;
            }
            Ok(())
        }
        Expr::Any(parts) => {
            w.put_u8(3)?;
            w.put_u32(parts.len() as u32)?;
            for part in parts {
                w.put_u64(part.0 as u64)?;
            }
            Ok(())
        }
        Expr::Not(inner) => {
            w.put_u8(4)?;
            w.put_u64(inner.0 as u64)
        }
        Expr::Hash(operands) => {
            w.put_u8(5)?;
            w.put_u32(operands.len() as u32)?;
            for operand in operands {
                write_operand(w, operand)?;
            }
            Ok(())
        }
        Expr::SlotKey { slot } => {
            w.put_u8(6)?;
            w.put_u16(slot.0)
        }
        Expr::FieldEq { slot, field, value } => {
            w.put_u8(7)?;
            w.put_u16(slot.0)?;
            w.put_u16(*field)?;
            write_value(w, value)
        }
    }
}

fn write_selector_key<W: Write>(w: &mut FieldWriter<W>, key: &SelectorKey) -> ImageResult<()> {
    match key {
        SelectorKey::Symbol(s) => {
            w.put_u8(0)?;
            w.put_str(s)
        }
        SelectorKey::Integer(i) => {
            w.put_u8(1)?;
            w.put_i64(*i)
        }
        SelectorKey::Float(bits) => {
            w.put_u8(2)?;
            w.put_u64(*bits)
        }
    }
}
