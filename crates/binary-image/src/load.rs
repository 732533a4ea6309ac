//! Image reader
//!
//! Rebuilds the arenas in record order, so every on-disk index becomes
//! the arena id it names. Every index is bounds-checked against its
//! table before use; a malformed image fails loudly instead of wiring a
//! dangling edge into the network.

use crate::records::{
    checked_index, BsaveDefrule, BsaveFactPatternNode, BsaveJoinLink, BsaveJoinNode, FieldReader,
    ImageError, ImageResult, IMAGE_MAGIC, IMAGE_VERSION,
};
use match_model::{
    JoinId, PatternNodeId, RuleId, SelectorKey, SlotIndex, SymbolTable, TemplateId, TestId, Value,
};
use rete::alpha::{PatternNetwork, PatternNode};
use rete::beta::{Direction, JoinFlags, JoinLink, JoinNetwork, JoinNode, RightEntry};
use rete::engine::{EngineConfig, RuleInfo};
use rete::expr::{Expr, ExpressionTable, Operand, TestOp};
use rete::Engine;
use std::io::Read;
use tracing::debug;

/// Deserialize a network image into a fresh engine. Memories start
/// empty; call [`Engine::reprime`] before asserting entities.
pub fn load_image<R: Read>(config: EngineConfig, input: R) -> ImageResult<Engine> {
    let mut r = FieldReader::new(input);

    let magic = [r.take_u8()?, r.take_u8()?, r.take_u8()?, r.take_u8()?];
    if magic != IMAGE_MAGIC {
        return Err(ImageError::BadMagic);
    }
    let version = r.take_u32()?;
    if version != IMAGE_VERSION {
        return Err(ImageError::UnsupportedVersion(version));
    }

    let _modules = r.take_u64()?;
    let rule_count = r.take_u64()? as usize;
    let join_count = r.take_u64()? as usize;
    let link_count = r.take_u64()? as usize;
    let right_prime_index = r.take_u64()?;
    let left_prime_index = r.take_u64()?;
    let goal_prime_index = r.take_u64()?;

    let symbols = SymbolTable::new();

    // Expression table.
    let expr_count = r.take_u64()? as usize;
    let mut exprs = ExpressionTable::new();
    for _ in 0..expr_count {
        let expr = read_expr(&mut r, &symbols)?;
        exprs.push_loaded(expr);
    }
    let test_of = |value: u64| -> ImageResult<Option<TestId>> {
        Ok(checked_index(value, expr_count, "expressions")?.map(|i| TestId(i as u32)))
    };

    // Template roots.
    let template_count = r.take_u64()? as usize;
    let mut roots = Vec::with_capacity(template_count);
    for _ in 0..template_count {
        let template = TemplateId(r.take_u32()?);
        let root = r.take_u64()?;
        roots.push((template, root));
    }

    // Pattern node records.
    let space = r.take_u64()?;
    if space % BsaveFactPatternNode::WIDTH != 0 {
        return Err(ImageError::BadRecord("pattern section size"));
    }
    let node_count = (space / BsaveFactPatternNode::WIDTH) as usize;
    let mut node_records = Vec::with_capacity(node_count);
    for _ in 0..node_count {
        node_records.push(BsaveFactPatternNode::read(&mut r)?);
    }

    // Selector entries.
    let selector_count = r.take_u64()? as usize;
    let mut selector_records = Vec::with_capacity(selector_count);
    for _ in 0..selector_count {
        let parent = r.take_u64()?;
        let key = read_selector_key(&mut r, &symbols)?;
        let child = r.take_u64()?;
        selector_records.push((parent, key, child));
    }

    // Join records.
    let space = r.take_u64()?;
    if space % BsaveJoinNode::WIDTH != 0 || (space / BsaveJoinNode::WIDTH) as usize != join_count {
        return Err(ImageError::BadRecord("join section size"));
    }
    let mut join_records = Vec::with_capacity(join_count);
    for _ in 0..join_count {
        join_records.push(BsaveJoinNode::read(&mut r)?);
    }

    // Link records.
    let space = r.take_u64()?;
    if space % BsaveJoinLink::WIDTH != 0 || (space / BsaveJoinLink::WIDTH) as usize != link_count {
        return Err(ImageError::BadRecord("link section size"));
    }
    let mut link_records = Vec::with_capacity(link_count);
    for _ in 0..link_count {
        link_records.push(BsaveJoinLink::read(&mut r)?);
    }

    // Rule names and records.
    let name_count = r.take_u64()? as usize;
    if name_count != rule_count {
        return Err(ImageError::BadRecord("rule name count"));
    }
    let mut names = Vec::with_capacity(name_count);
    for _ in 0..name_count {
        names.push(r.take_string()?);
    }
    let space = r.take_u64()?;
    if space % BsaveDefrule::WIDTH != 0 || (space / BsaveDefrule::WIDTH) as usize != rule_count {
        return Err(ImageError::BadRecord("rule section size"));
    }
    let mut rule_records = Vec::with_capacity(rule_count);
    for _ in 0..rule_count {
        rule_records.push(BsaveDefrule::read(&mut r)?);
    }

    // Rebuild the pattern network; record order is arena order.
    let mut patterns = PatternNetwork::new();
    for record in &node_records {
        let mut node = PatternNode::new(
            TemplateId(0),
            SlotIndex(record.which_slot),
            record.which_field,
        );
        node.flags.singlefield = record.header.flags & (1 << 0) != 0;
        node.flags.multifield = record.header.flags & (1 << 1) != 0;
        node.flags.stop = record.header.flags & (1 << 2) != 0;
        node.flags.begin_slot = record.header.flags & (1 << 6) != 0;
        node.flags.end_slot = record.header.flags & (1 << 7) != 0;
        node.flags.selector = record.header.flags & (1 << 8) != 0;
        node.leave_fields = record.leave_fields;
        node.network_test = test_of(record.network_test)?;
        node.right_hash = test_of(record.header.right_hash)?;
        node.modify_slots = record.modify_slots;
        patterns.add_node(node);
    }
    for (i, record) in node_records.iter().enumerate() {
        let id = PatternNodeId(i as u32);
        let next_level = checked_index(record.next_level, node_count, "pattern nodes")?;
        let last_level = checked_index(record.last_level, node_count, "pattern nodes")?;
        let left_node = checked_index(record.left_node, node_count, "pattern nodes")?;
        let right_node = checked_index(record.right_node, node_count, "pattern nodes")?;
        let entry_join = checked_index(record.header.entry_join, join_count, "joins")?;
        if let Some(node) = patterns.node_mut(id) {
            node.next_level = next_level.map(|i| PatternNodeId(i as u32));
            node.last_level = last_level.map(|i| PatternNodeId(i as u32));
            node.left_node = left_node.map(|i| PatternNodeId(i as u32));
            node.right_node = right_node.map(|i| PatternNodeId(i as u32));
            node.entry_join = entry_join.map(|i| JoinId(i as u32));
        }
        if record.header.flags & (1 << 2) != 0 {
            patterns.add_memory(id);
        }
    }
    for (template, root) in roots {
        if let Some(root) = checked_index(root, node_count, "pattern nodes")? {
            let root = PatternNodeId(root as u32);
            patterns.set_root(template, root);
            // Template ownership flows down from the root chain.
            assign_template(&mut patterns, template, root);
        }
    }
    for (parent, key, child) in selector_records {
        let parent = checked_index(parent, node_count, "pattern nodes")?
            .ok_or(ImageError::BadRecord("null selector parent"))?;
        let child = checked_index(child, node_count, "pattern nodes")?
            .ok_or(ImageError::BadRecord("null selector child"))?;
        patterns.set_selector_child(
            PatternNodeId(parent as u32),
            key,
            PatternNodeId(child as u32),
        );
    }

    // Rebuild the join network.
    let mut joins = JoinNetwork::new();
    for record in &join_records {
        let mut flags = JoinFlags::default();
        flags.first_join = record.flags_depth & (1 << 0) != 0;
        flags.logical_join = record.flags_depth & (1 << 1) != 0;
        flags.goal_join = record.flags_depth & (1 << 2) != 0;
        flags.explicit_join = record.flags_depth & (1 << 3) != 0;
        flags.join_from_the_right = record.flags_depth & (1 << 4) != 0;
        flags.pattern_is_negated = record.flags_depth & (1 << 5) != 0;
        flags.pattern_is_exists = record.flags_depth & (1 << 6) != 0;
        let depth = ((record.flags_depth >> 10) & 0x7f) as u16;

        let mut join = JoinNode::new(flags, depth);
        join.rhs_type = ((record.flags_depth >> 7) & 0b111) as u8;
        join.network_test = test_of(record.network_test)?;
        join.secondary_network_test = test_of(record.secondary_network_test)?;
        join.goal_expression = test_of(record.goal_expression)?;
        join.left_hash = test_of(record.left_hash)?;
        join.right_hash = test_of(record.right_hash)?;
        join.right_side_entry = if flags.join_from_the_right {
            checked_index(record.right_side_entry_structure, join_count, "joins")?
                .map(|i| RightEntry::Join(JoinId(i as u32)))
        } else {
            checked_index(record.right_side_entry_structure, node_count, "pattern nodes")?
                .map(|i| RightEntry::Pattern(PatternNodeId(i as u32)))
        };
        join.last_level = checked_index(record.last_level, join_count, "joins")?
            .map(|i| JoinId(i as u32));
        join.right_match_node = checked_index(record.right_match_node, join_count, "joins")?
            .map(|i| JoinId(i as u32));
        join.rule_to_activate = checked_index(record.rule_to_activate, rule_count, "rules")?
            .map(|i| RuleId(i as u32));
        joins.add(join);
    }
    for (i, record) in join_records.iter().enumerate() {
        let links = follow_chain(&link_records, record.next_links, join_count)?;
        if let Some(join) = joins.get_mut(JoinId(i as u32)) {
            join.next_links = links.into();
        }
    }
    joins.right_prime = follow_chain(&link_records, right_prime_index, join_count)?;
    joins.left_prime = follow_chain(&link_records, left_prime_index, join_count)?;
    joins.goal_prime = follow_chain(&link_records, goal_prime_index, join_count)?;

    // Rebuild the rules.
    let mut rules = Vec::with_capacity(rule_count);
    for record in &rule_records {
        let name = names
            .get(record.name as usize)
            .ok_or(ImageError::DanglingIndex {
                index: record.name as u64,
                table: "rule names",
            })?
            .clone();
        rules.push(RuleInfo {
            name,
            salience: record.salience,
            certainty: record.certainty,
            auto_focus: record.complexity_flags & (1 << 12) != 0,
            complexity: record.complexity_flags & 0x0fff,
            local_var_cnt: record.local_var_cnt,
            logical_join: checked_index(record.logical_join, join_count, "joins")?
                .map(|i| JoinId(i as u32)),
            last_join: checked_index(record.last_join, join_count, "joins")?
                .map(|i| JoinId(i as u32)),
            disjunct: checked_index(record.disjunct, rule_count, "rules")?
                .map(|i| RuleId(i as u32)),
        });
    }

    debug!(
        nodes = node_count,
        joins = join_count,
        links = link_count,
        rules = rule_count,
        "network image loaded"
    );
    Ok(Engine::restore(config, symbols, exprs, patterns, joins, rules))
}

fn assign_template(patterns: &mut PatternNetwork, template: TemplateId, root: PatternNodeId) {
    for id in patterns.traversal_from(root) {
        if let Some(node) = patterns.node_mut(id) {
            node.template = template;
        }
    }
}

fn follow_chain(
    links: &[BsaveJoinLink],
    start: u64,
    join_count: usize,
) -> ImageResult<Vec<JoinLink>> {
    let mut out = Vec::new();
    let mut cursor = checked_index(start, links.len(), "links")?;
    while let Some(i) = cursor {
        if out.len() > links.len() {
            return Err(ImageError::BadRecord("link chain cycle"));
        }
        let record = &links[i];
        let join = checked_index(record.join, join_count, "joins")?
            .ok_or(ImageError::BadRecord("null link target"))?;
        let enter_direction = match record.enter_direction {
            b'L' => Direction::Lhs,
            b'R' => Direction::Rhs,
            _ => return Err(ImageError::BadRecord("link direction")),
        };
        out.push(JoinLink {
            enter_direction,
            join: JoinId(join as u32),
        });
        cursor = checked_index(record.next, links.len(), "links")?;
    }
    Ok(out)
}

fn read_value<R: Read>(r: &mut FieldReader<R>, symbols: &SymbolTable) -> ImageResult<Value> {
    match r.take_u8()? {
        0 => Ok(Value::Symbol(symbols.intern(&r.take_string()?))),
        1 => Ok(Value::Integer(r.take_i64()?)),
        2 => Ok(Value::Float(f64::from_bits(r.take_u64()?))),
        3 => {
            let count = r.take_u32()? as usize;
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(read_value(r, symbols)?);
            }
            Ok(Value::Multifield(values))
        }
        _ => Err(ImageError::BadRecord("value tag")),
    }
}

fn read_operand<R: Read>(r: &mut FieldReader<R>, symbols: &SymbolTable) -> ImageResult<Operand> {
    match r.take_u8()? {
        0 => Ok(Operand::Const(read_value(r, symbols)?)),
        1 => Ok(Operand::Lhs {
            depth: r.take_u16()?,
            slot: SlotIndex(r.take_u16()?),
        }),
        2 => Ok(Operand::Rhs {
            slot: SlotIndex(r.take_u16()?),
        }),
        3 => Ok(Operand::LhsSpan {
            depth: r.take_u16()?,
            marker: r.take_u16()?,
        }),
        4 => Ok(Operand::RhsSpan {
            marker: r.take_u16()?,
        }),
        _ => Err(ImageError::BadRecord("operand tag")),
    }
}

fn read_op<R: Read>(r: &mut FieldReader<R>) -> ImageResult<TestOp> {
    Ok(match r.take_u8()? {
        0 => TestOp::Eq,
        1 => TestOp::Ne,
        2 => TestOp::Lt,
        3 => TestOp::Le,
        4 => TestOp::Gt,
        5 => TestOp::Ge,
        _ => return Err(ImageError::BadRecord("comparison tag")),
    })
}

fn read_expr<R: Read>(r: &mut FieldReader<R>, symbols: &SymbolTable) -> ImageResult<Expr> {
    match r.take_u8()? {
        0 => Ok(Expr::True),
        1 => Ok(Expr::Cmp {
            op: read_op(r)?,
            left: read_operand(r, symbols)?,
            right: read_operand(r, symbols)?,
        }),
        2 => {
            let count = r.take_u32()? as usize;
            let mut parts = Vec::with_capacity(count);
            for _ in 0..count {
                parts.push(TestId(r.take_u64()? as u32));
            }
            Ok(Expr::All(parts))
        }
        3 => {
            let count = r.take_u32()? as usize;
            let mut parts = Vec::with_capacity(count);
            for _ in 0..count {
                parts.push(TestId(r.take_u64()? as u32));
            }
            Ok(Expr::Any(parts))
        }
        4 => Ok(Expr::Not(TestId(r.take_u64()? as u32))),
        5 => {
            let count = r.take_u32()? as usize;
            let mut operands = Vec::with_capacity(count);
            for _ in 0..count {
                operands.push(read_operand(r, symbols)?);
            }
            Ok(Expr::Hash(operands))
        }
        6 => Ok(Expr::SlotKey {
            slot: SlotIndex(r.take_u16()?),
        }),
        7 => Ok(Expr::FieldEq {
            slot: SlotIndex(r.take_u16()?),
            field: r.take_u16()?,
            value: read_value(r, symbols)?,
        }),
        _ => Err(ImageError::BadRecord("expression tag")),
    }
}

fn read_selector_key<R: Read>(
    r: &mut FieldReader<R>,
    symbols: &SymbolTable,
) -> ImageResult<SelectorKey> {
    match r.take_u8()? {
        0 => Ok(SelectorKey::Symbol(symbols.intern(&r.take_string()?))),
        1 => Ok(SelectorKey::Integer(r.take_i64()?)),
        2 => Ok(SelectorKey::Float(r.take_u64()?)),
        _ => Err(ImageError::BadRecord("selector key tag")),
    }
}
