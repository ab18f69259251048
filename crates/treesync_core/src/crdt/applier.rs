//! Change application.
//!
//! A [`ChangeCommand`] is applied in two phases. [`plan_command`] resolves
//! the target and checks every sub-action against a simulated view of the
//! tree (child identifiers, text length) without writing anything. Only a
//! plan that passed as a whole is executed by [`execute_plan`], inside one
//! transaction. A failing command therefore leaves the tree untouched.
//!
//! `undo` and `redo` are not part of a plan: they need transactions of their
//! own and are run by the [`Replica`](super::Replica) after the mutations.

use yrs::{Text, TransactionMut, Xml, XmlElementRef, XmlFragment, XmlFragmentRef, XmlOut, XmlTextRef};

use super::builder::{PreparedNode, insert_nodes, prepare_nodes, utf16_len};
use super::identity::{ID_ATTRIBUTE, TEXT_TAG, Target, child_ids, child_index_of, resolve};
use super::serializer::text_len;
use super::types::{AttributeMap, ChangeCommand, DeleteChildren, InsertChildren};
use super::value::{attrs_from_map, json_to_any};
use crate::error::{Result, TreeSyncError};

/// One validated primitive mutation.
#[derive(Debug)]
enum Step {
    Detach { parent: Target, index: u32 },
    InsertChildren { index: u32, nodes: Vec<PreparedNode> },
    DeleteChildren { index: u32, length: u32 },
    RemoveAttributes(Vec<String>),
    SetAttributes(AttributeMap),
    InsertText { index: u32, text: String, attributes: Option<AttributeMap> },
    FormatText { from: u32, length: u32, attributes: AttributeMap },
    DeleteText { index: u32, length: u32 },
}

/// The validated mutations of one command, in application order.
#[derive(Debug)]
pub struct Plan {
    target: Target,
    run: Option<XmlTextRef>,
    steps: Vec<Step>,
}

/// Validate a command against the current tree.
///
/// The target is resolved even for commands that only undo or redo, so a
/// stale `nodeID` is reported the same way for every command.
pub fn plan_command(txn: &TransactionMut, root: &XmlFragmentRef, command: &ChangeCommand) -> Result<Plan> {
    let target = resolve(txn, root, command.node_id.as_deref())?;
    let mut plan = Plan {
        target: target.clone(),
        run: None,
        steps: Vec::new(),
    };

    if command.delete {
        plan.steps.push(plan_delete(txn, &target, command)?);
        return Ok(plan);
    }

    if command.insert_children.is_some() || command.delete_children.is_some() {
        if let Target::Element(element) = &target {
            if element.tag().as_ref() == TEXT_TAG {
                return Err(TreeSyncError::type_mismatch("container element", format!("<{}>", TEXT_TAG)));
            }
        }
        let mut children = match &target {
            Target::Root(fragment) => child_ids(txn, fragment),
            Target::Element(element) => child_ids(txn, element),
        };
        if let Some(insert) = &command.insert_children {
            plan.steps.push(plan_insert_children(&mut children, insert)?);
        }
        if let Some(delete) = &command.delete_children {
            plan.steps.push(plan_delete_children(&mut children, delete)?);
        }
    }

    if let Some(names) = &command.remove_attributes {
        expect_element(&target)?;
        for name in names {
            guard_identifier(name)?;
        }
        plan.steps.push(Step::RemoveAttributes(names.clone()));
    }

    if let Some(attributes) = &command.set_attributes {
        expect_element(&target)?;
        for name in attributes.keys() {
            guard_identifier(name)?;
        }
        plan.steps.push(Step::SetAttributes(attributes.clone()));
    }

    if command.insert_text.is_some() || command.format_text.is_some() || command.delete_text.is_some() {
        let run = text_run(txn, &target)?;
        let mut len = text_len(txn, &run);

        if let Some(insert) = &command.insert_text {
            check_range("insertText", insert.index, 0, len)?;
            len += utf16_len(&insert.text);
            plan.steps.push(Step::InsertText {
                index: insert.index,
                text: insert.text.clone(),
                attributes: insert.attributes.clone().filter(|a| !a.is_empty()),
            });
        }
        if let Some(format) = &command.format_text {
            check_range("formatText", format.from, format.length, len)?;
            plan.steps.push(Step::FormatText {
                from: format.from,
                length: format.length,
                attributes: format.attributes.clone(),
            });
        }
        if let Some(delete) = &command.delete_text {
            check_range("deleteText", delete.index, delete.length, len)?;
            plan.steps.push(Step::DeleteText {
                index: delete.index,
                length: delete.length,
            });
        }
        plan.run = Some(run);
    }

    Ok(plan)
}

fn plan_delete(txn: &TransactionMut, target: &Target, command: &ChangeCommand) -> Result<Step> {
    let element = match target {
        Target::Root(_) => {
            return Err(TreeSyncError::InvariantViolation("delete".to_string()));
        }
        Target::Element(element) => element,
    };

    let mut others = command.clone();
    others.delete = false;
    if others.has_mutations() {
        return Err(TreeSyncError::InvalidCommand(
            "delete cannot be combined with other changes to the same node".to_string(),
        ));
    }

    let parent = match element.parent() {
        Some(XmlOut::Element(parent)) => Target::Element(parent),
        Some(XmlOut::Fragment(fragment)) => Target::Root(fragment),
        Some(XmlOut::Text(_)) => {
            return Err(TreeSyncError::ProtocolViolation(
                "element nested inside a text run".to_string(),
            ));
        }
        None => return Err(detached(element, txn)),
    };
    let index = match &parent {
        Target::Root(fragment) => child_index_of(txn, fragment, element),
        Target::Element(parent) => child_index_of(txn, parent, element),
    }
    .ok_or_else(|| detached(element, txn))?;

    Ok(Step::Detach { parent, index })
}

fn detached(element: &XmlElementRef, txn: &TransactionMut) -> TreeSyncError {
    let id = super::identity::element_id(txn, element).unwrap_or_default();
    TreeSyncError::NotFound(format!("parent of {}", id))
}

fn plan_insert_children(children: &mut Vec<Option<String>>, insert: &InsertChildren) -> Result<Step> {
    let index = match (&insert.after, insert.index) {
        (Some(after), _) => position_after(children, after)?,
        (None, Some(index)) => {
            check_range("insertChildren", index, 0, children.len() as u32)?;
            index
        }
        (None, None) => children.len() as u32,
    };

    let nodes = prepare_nodes(&insert.children)?;
    let ids = nodes.iter().map(|node| node.id().map(str::to_string));
    let at = index as usize;
    children.splice(at..at, ids);

    Ok(Step::InsertChildren { index, nodes })
}

fn plan_delete_children(children: &mut Vec<Option<String>>, delete: &DeleteChildren) -> Result<Step> {
    let index = match (&delete.after, delete.index) {
        (Some(after), _) => position_after(children, after)?,
        (None, Some(index)) => index,
        (None, None) => {
            return Err(TreeSyncError::InvalidCommand(
                "deleteChildren needs either `after` or `index`".to_string(),
            ));
        }
    };
    check_range("deleteChildren", index, delete.length, children.len() as u32)?;

    let at = index as usize;
    children.drain(at..at + delete.length as usize);

    Ok(Step::DeleteChildren {
        index,
        length: delete.length,
    })
}

/// Position right after the child with identifier `after`.
fn position_after(children: &[Option<String>], after: &str) -> Result<u32> {
    children
        .iter()
        .position(|id| id.as_deref() == Some(after))
        .map(|position| position as u32 + 1)
        .ok_or_else(|| TreeSyncError::NotFound(after.to_string()))
}

fn check_range(action: &str, start: u32, length: u32, len: u32) -> Result<()> {
    if start.checked_add(length).is_none_or(|end| end > len) {
        return Err(TreeSyncError::InvalidCommand(format!(
            "{}: range {}..{}+{} is out of bounds (length {})",
            action, start, start, length, len
        )));
    }
    Ok(())
}

fn expect_element(target: &Target) -> Result<&XmlElementRef> {
    match target {
        Target::Element(element) => Ok(element),
        Target::Root(_) => Err(TreeSyncError::type_mismatch("element", target.describe())),
    }
}

fn guard_identifier(name: &str) -> Result<()> {
    if name == ID_ATTRIBUTE {
        return Err(TreeSyncError::InvalidCommand(format!(
            "the {} attribute cannot be changed",
            ID_ATTRIBUTE
        )));
    }
    Ok(())
}

/// The sole text run of a `text` element.
fn text_run(txn: &TransactionMut, target: &Target) -> Result<XmlTextRef> {
    let element = match target {
        Target::Element(element) if element.tag().as_ref() == TEXT_TAG => element,
        other => return Err(TreeSyncError::type_mismatch("<text> element", other.describe())),
    };
    match element.get(txn, 0) {
        Some(XmlOut::Text(run)) => Ok(run),
        _ => Err(TreeSyncError::NotFound(format!(
            "text run of {}",
            super::identity::element_id(txn, element).unwrap_or_default()
        ))),
    }
}

/// Write a validated plan.
pub fn execute_plan(txn: &mut TransactionMut, plan: &Plan) {
    for step in &plan.steps {
        match step {
            Step::Detach { parent, index } => match parent {
                Target::Root(fragment) => fragment.remove_range(txn, *index, 1),
                Target::Element(element) => element.remove_range(txn, *index, 1),
            },
            Step::InsertChildren { index, nodes } => match &plan.target {
                Target::Root(fragment) => insert_nodes(txn, fragment, *index, nodes),
                Target::Element(element) => insert_nodes(txn, element, *index, nodes),
            },
            Step::DeleteChildren { index, length } => {
                if *length > 0 {
                    match &plan.target {
                        Target::Root(fragment) => fragment.remove_range(txn, *index, *length),
                        Target::Element(element) => element.remove_range(txn, *index, *length),
                    }
                }
            }
            Step::RemoveAttributes(names) => {
                if let Target::Element(element) = &plan.target {
                    for name in names {
                        element.remove_attribute(txn, name);
                    }
                }
            }
            Step::SetAttributes(attributes) => {
                if let Target::Element(element) = &plan.target {
                    for (name, value) in attributes {
                        element.insert_attribute(txn, name.as_str(), json_to_any(value));
                    }
                }
            }
            Step::InsertText {
                index,
                text,
                attributes,
            } => {
                if let Some(run) = &plan.run {
                    if text.is_empty() {
                        continue;
                    }
                    match attributes {
                        Some(attributes) => {
                            run.insert_with_attributes(txn, *index, text, attrs_from_map(attributes))
                        }
                        None => run.insert(txn, *index, text),
                    }
                }
            }
            Step::FormatText {
                from,
                length,
                attributes,
            } => {
                if let Some(run) = plan.run.as_ref().filter(|_| *length > 0) {
                    run.format(txn, *from, *length, attrs_from_map(attributes));
                }
            }
            Step::DeleteText { index, length } => {
                if let Some(run) = plan.run.as_ref().filter(|_| *length > 0) {
                    run.remove_range(txn, *index, *length);
                }
            }
        }
    }
}

/// Validate and apply the mutations of one command.
pub fn apply_command(txn: &mut TransactionMut, root: &XmlFragmentRef, command: &ChangeCommand) -> Result<()> {
    let plan = plan_command(txn, root, command)?;
    log::debug!(
        "ChangeApplier: applying {} steps to {}",
        plan.steps.len(),
        plan.target.describe()
    );
    execute_plan(txn, &plan);
    Ok(())
}
