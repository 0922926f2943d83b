// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! Whole-graph validation.
//!
//! Walks every pointer reachable from the root, so any malformed pointer,
//! over-deep nesting, or over-budget traversal is reported up front.
//! Validation shares the message's traversal budget with later reads;
//! it is optional for trusted inputs but mandatory for anything crossing
//! a trust boundary.

use crate::any_pointer;
use crate::layout::{ListReader, StructReader};
use crate::message::{Reader, ReaderSegments};
use crate::ptr::{ElementSize, PointerKind};
use crate::Result;

/// Walks the reachable pointer graph from the root, enforcing the
/// configured traversal budget, nesting depth, and segment count.
pub fn validate<S>(message: &Reader<S>) -> Result<()>
where
    S: ReaderSegments,
{
    walk_pointer(&message.get_root()?)
}

fn walk_pointer(pointer: &any_pointer::Reader<'_>) -> Result<()> {
    match pointer.kind()? {
        None | Some(PointerKind::Capability) => Ok(()),
        Some(PointerKind::Struct) => walk_struct(&pointer.get_struct()?),
        Some(PointerKind::List) => walk_list(&pointer.get_list(None)?),
        Some(PointerKind::Far) => unreachable!("resolution never yields a far pointer"),
    }
}

fn walk_struct(reader: &StructReader<'_>) -> Result<()> {
    for i in 0..reader.ptr_words() {
        walk_pointer(&any_pointer::Reader::new(reader.get_pointer(i)))?;
    }
    Ok(())
}

fn walk_list(reader: &ListReader<'_>) -> Result<()> {
    match reader.element_size() {
        ElementSize::Pointer => {
            for i in 0..reader.len() {
                walk_pointer(&any_pointer::Reader::new(reader.get_pointer_element(i)?))?;
            }
            Ok(())
        }
        ElementSize::InlineComposite => {
            for i in 0..reader.len() {
                walk_struct(&reader.get_struct_element(i)?)?;
            }
            Ok(())
        }
        // Primitive content was bounds-checked and charged when the list
        // pointer was followed.
        _ => Ok(()),
    }
}
