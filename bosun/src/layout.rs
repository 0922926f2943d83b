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

//! Struct, list, and pointer readers and builders.
//!
//! Readers are zero-copy views into a message's segments. Non-strict data
//! accessors implement the schema-evolution contract: reads past the end
//! of a struct's data section return the type's zero default, and writes
//! past the end are silent no-ops. The `_strict` variants signal
//! `OutOfBounds` instead.

use crate::arena::{word_at, BuildArena, ReadCtx};
use crate::ptr::{ElementSize, PointerKind, WirePointer, MAX_LIST_ELEMENTS};
use crate::text;
use crate::{Error, Result, BYTES_PER_WORD};

/// Hard cap on far-pointer chain length.
pub const MAX_FAR_DEPTH: u8 = 8;

/// A fully resolved pointer: the effective pointer word (after any far
/// indirection) plus the segment and word index where its content begins.
/// For inline-composite lists, `content` is the tag word.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ResolvedPointer {
    pub ptr: WirePointer,
    pub segment: u32,
    pub content: u32,
}

fn content_from_offset(seg_words: u32, origin: u32, offset: i32) -> Result<u32> {
    let target = origin as i64 + 1 + offset as i64;
    if target < 0 || target > seg_words as i64 {
        return Err(Error::invalid_pointer(
            "pointer offset is outside its segment",
        ));
    }
    Ok(target as u32)
}

/// Resolves the pointer word at `(segment, word)`, following far pointers.
/// Returns `None` for a null pointer.
pub(crate) fn resolve_pointer(
    ctx: ReadCtx<'_>,
    segment: u32,
    word: u32,
    depth: u8,
) -> Result<Option<ResolvedPointer>> {
    if depth > MAX_FAR_DEPTH {
        return Err(Error::pointer_depth_limit(
            "pointer chain exceeds the far-pointer depth cap",
        ));
    }
    let seg = ctx.segment(segment)?;
    let seg_words = (seg.len() / BYTES_PER_WORD) as u32;
    if word >= seg_words {
        return Err(Error::out_of_bounds("pointer position outside segment"));
    }
    let ptr = WirePointer(word_at(seg, word));
    if ptr.is_null() {
        return Ok(None);
    }
    match ptr.kind() {
        PointerKind::Struct | PointerKind::List => {
            let content = content_from_offset(seg_words, word, ptr.offset_words())?;
            Ok(Some(ResolvedPointer {
                ptr,
                segment,
                content,
            }))
        }
        PointerKind::Capability => Ok(Some(ResolvedPointer {
            ptr,
            segment,
            content: 0,
        })),
        PointerKind::Far => {
            let pad_seg_id = ptr.far_segment();
            let pad_seg = ctx.far_segment(pad_seg_id)?;
            let pad_words = (pad_seg.len() / BYTES_PER_WORD) as u32;
            let pad = ptr.far_pad_word();
            if !ptr.far_is_double() {
                if pad >= pad_words {
                    return Err(Error::invalid_far_pointer(
                        "far landing pad outside its segment",
                    ));
                }
                // The pad holds the real pointer; offsets are relative to
                // the pad's own position.
                resolve_pointer(ctx, pad_seg_id, pad, depth + 1)
            } else {
                if pad.checked_add(2).map_or(true, |end| end > pad_words) {
                    return Err(Error::invalid_far_pointer(
                        "double-far landing pad outside its segment",
                    ));
                }
                let far = WirePointer(word_at(pad_seg, pad));
                let tag = WirePointer(word_at(pad_seg, pad + 1));
                if far.kind() != PointerKind::Far || far.far_is_double() {
                    return Err(Error::invalid_far_pointer(
                        "double-far pad must begin with a single far pointer",
                    ));
                }
                let content_seg = far.far_segment();
                let content = far.far_pad_word();
                if content as u64 > ctx.far_segment(content_seg)?.len() as u64 / 8 {
                    return Err(Error::invalid_far_pointer(
                        "double-far content outside its segment",
                    ));
                }
                if tag.kind() == PointerKind::Far {
                    return Err(Error::invalid_far_pointer(
                        "double-far tag may not itself be a far pointer",
                    ));
                }
                Ok(Some(ResolvedPointer {
                    ptr: tag,
                    segment: content_seg,
                    content,
                }))
            }
        }
    }
}

fn check_span(ctx: ReadCtx<'_>, segment: u32, start: u32, words: u64) -> Result<()> {
    let seg_words = ctx.segment_words(segment)? as u64;
    if (start as u64).checked_add(words).map_or(true, |end| end > seg_words) {
        return Err(Error::out_of_bounds(
            "pointer target runs past the end of its segment",
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Readers
// ---------------------------------------------------------------------------

/// A reader positioned on one pointer slot.
#[derive(Clone, Copy)]
pub struct PointerReader<'a> {
    ctx: ReadCtx<'a>,
    segment: u32,
    word: u32,
    nesting: i32,
    absent: bool,
}

impl<'a> PointerReader<'a> {
    pub(crate) fn new(ctx: ReadCtx<'a>, segment: u32, word: u32, nesting: i32) -> Self {
        Self {
            ctx,
            segment,
            word,
            nesting,
            absent: false,
        }
    }

    /// A reader that behaves like a null pointer. Returned for pointer
    /// indices past the end of a struct's pointer section.
    pub(crate) fn absent(ctx: ReadCtx<'a>, nesting: i32) -> Self {
        Self {
            ctx,
            segment: 0,
            word: 0,
            nesting,
            absent: true,
        }
    }

    fn resolve(&self) -> Result<Option<ResolvedPointer>> {
        if self.absent {
            return Ok(None);
        }
        resolve_pointer(self.ctx, self.segment, self.word, 0)
    }

    pub fn is_null(&self) -> bool {
        match self.resolve() {
            Ok(resolved) => resolved.is_none(),
            Err(_) => false,
        }
    }

    fn descend(&self) -> Result<()> {
        if self.nesting <= 0 {
            return Err(Error::nesting_limit_exceeded(
                "message is too deeply nested; see ReaderOptions::nesting_limit",
            ));
        }
        Ok(())
    }

    pub fn get_struct(&self) -> Result<StructReader<'a>> {
        self.descend()?;
        let resolved = self
            .resolve()?
            .ok_or_else(|| Error::invalid_pointer("read a null pointer as a struct"))?;
        if resolved.ptr.kind() != PointerKind::Struct {
            return Err(Error::invalid_pointer("expected a struct pointer"));
        }
        let data_words = resolved.ptr.struct_data_words();
        let ptr_words = resolved.ptr.struct_ptr_words();
        let total = data_words as u64 + ptr_words as u64;
        check_span(self.ctx, resolved.segment, resolved.content, total)?;
        self.ctx.limiter.can_read(total)?;
        StructReader::new(
            self.ctx,
            resolved.segment,
            resolved.content,
            data_words,
            ptr_words,
            self.nesting - 1,
        )
    }

    pub fn get_list(&self, expected: Option<ElementSize>) -> Result<ListReader<'a>> {
        self.descend()?;
        let resolved = self
            .resolve()?
            .ok_or_else(|| Error::invalid_pointer("read a null pointer as a list"))?;
        self.list_from_resolved(resolved, expected)
    }

    fn list_from_resolved(
        &self,
        resolved: ResolvedPointer,
        expected: Option<ElementSize>,
    ) -> Result<ListReader<'a>> {
        if resolved.ptr.kind() != PointerKind::List {
            return Err(Error::invalid_pointer("expected a list pointer"));
        }
        let elem = resolved.ptr.list_element_size();
        if let Some(want) = expected {
            if want != elem {
                return Err(Error::invalid_pointer(format!(
                    "list has element size {elem:?} but {want:?} was expected"
                )));
            }
        }
        if elem == ElementSize::InlineComposite {
            let word_count = resolved.ptr.list_element_count();
            check_span(self.ctx, resolved.segment, resolved.content, 1 + word_count as u64)?;
            let seg = self.ctx.segment(resolved.segment)?;
            let tag = WirePointer(word_at(seg, resolved.content));
            if tag.kind() != PointerKind::Struct {
                return Err(Error::invalid_inline_composite(
                    "inline-composite tag is not struct-shaped",
                ));
            }
            let count = tag.tag_element_count();
            let data_words = tag.struct_data_words();
            let ptr_words = tag.struct_ptr_words();
            let per_element = data_words as u64 + ptr_words as u64;
            if count as u64 * per_element > word_count as u64 {
                return Err(Error::invalid_inline_composite(
                    "inline-composite element layout overruns the list's words",
                ));
            }
            self.ctx.limiter.can_read(1 + word_count as u64)?;
            Ok(ListReader {
                ctx: self.ctx,
                segment: resolved.segment,
                seg_bytes: seg,
                start: resolved.content + 1,
                count,
                elem,
                step_bits: (per_element * 64) as u32,
                data_words,
                ptr_words,
                nesting: self.nesting - 1,
            })
        } else {
            let count = resolved.ptr.list_element_count();
            let step = elem.step_bits();
            let total_bits = count as u64 * step as u64;
            let words = total_bits.div_ceil(64);
            check_span(self.ctx, resolved.segment, resolved.content, words)?;
            self.ctx.limiter.can_read(words.max(1))?;
            Ok(ListReader {
                ctx: self.ctx,
                segment: resolved.segment,
                seg_bytes: self.ctx.segment(resolved.segment)?,
                start: resolved.content,
                count,
                elem,
                step_bits: step,
                data_words: 0,
                ptr_words: 0,
                nesting: self.nesting - 1,
            })
        }
    }

    /// Reads a text pointer. Null pointers read as the empty string; the
    /// trailing NUL terminator is checked and stripped.
    pub fn get_text(&self) -> Result<text::Reader<'a>> {
        match self.resolve()? {
            None => Ok(text::Reader::empty()),
            Some(resolved) => {
                self.descend()?;
                let list = self.list_from_resolved(resolved, Some(ElementSize::Byte))?;
                match list.raw_bytes().split_last() {
                    Some((0, contents)) => Ok(text::Reader::new(contents)),
                    _ => Err(Error::invalid_pointer("text is not NUL-terminated")),
                }
            }
        }
    }

    /// Reads a data pointer. Null pointers read as the empty blob.
    pub fn get_data(&self) -> Result<&'a [u8]> {
        match self.resolve()? {
            None => Ok(&[]),
            Some(resolved) => {
                self.descend()?;
                let list = self.list_from_resolved(resolved, Some(ElementSize::Byte))?;
                Ok(list.raw_bytes())
            }
        }
    }

    /// Reads a capability pointer, returning its capability-table index.
    pub fn get_capability(&self) -> Result<u32> {
        let resolved = self
            .resolve()?
            .ok_or_else(|| Error::invalid_pointer("read a null pointer as a capability"))?;
        if resolved.ptr.kind() != PointerKind::Capability {
            return Err(Error::invalid_pointer("expected a capability pointer"));
        }
        Ok(resolved.ptr.cap_index())
    }

    /// The kind of the pointer after far resolution, or `None` if null.
    pub(crate) fn resolved_kind(&self) -> Result<Option<PointerKind>> {
        Ok(self.resolve()?.map(|r| r.ptr.kind()))
    }
}

/// A zero-copy view of one struct.
#[derive(Clone, Copy, Debug)]
pub struct StructReader<'a> {
    ctx: ReadCtx<'a>,
    segment: u32,
    data: &'a [u8],
    ptr_start: u32,
    ptr_words: u16,
    nesting: i32,
}

macro_rules! data_getters {
    ($get:ident, $get_strict:ident, $t:ty) => {
        /// Reads the value at `byte_offset` in the data section, or the
        /// zero default if the offset is past the end.
        pub fn $get(&self, byte_offset: u32) -> $t {
            let off = byte_offset as usize;
            match self.data.get(off..off + core::mem::size_of::<$t>()) {
                Some(bytes) => <$t>::from_le_bytes(bytes.try_into().unwrap()),
                None => 0 as $t,
            }
        }

        /// Like the non-strict getter, but signals `OutOfBounds` instead
        /// of defaulting.
        pub fn $get_strict(&self, byte_offset: u32) -> Result<$t> {
            let off = byte_offset as usize;
            match self.data.get(off..off + core::mem::size_of::<$t>()) {
                Some(bytes) => Ok(<$t>::from_le_bytes(bytes.try_into().unwrap())),
                None => Err(Error::out_of_bounds(
                    "read past the end of a struct's data section",
                )),
            }
        }
    };
}

impl<'a> StructReader<'a> {
    pub(crate) fn new(
        ctx: ReadCtx<'a>,
        segment: u32,
        data_word: u32,
        data_words: u16,
        ptr_words: u16,
        nesting: i32,
    ) -> Result<Self> {
        let seg = ctx.segment(segment)?;
        let start = data_word as usize * BYTES_PER_WORD;
        let len = data_words as usize * BYTES_PER_WORD;
        let data = seg
            .get(start..start + len)
            .ok_or_else(|| Error::out_of_bounds("struct data section outside segment"))?;
        Ok(Self {
            ctx,
            segment,
            data,
            ptr_start: data_word + data_words as u32,
            ptr_words,
            nesting,
        })
    }

    pub fn data_words(&self) -> u16 {
        (self.data.len() / BYTES_PER_WORD) as u16
    }

    pub fn ptr_words(&self) -> u16 {
        self.ptr_words
    }

    pub fn data_section(&self) -> &'a [u8] {
        self.data
    }

    data_getters!(get_u8, get_u8_strict, u8);
    data_getters!(get_u16, get_u16_strict, u16);
    data_getters!(get_u32, get_u32_strict, u32);
    data_getters!(get_u64, get_u64_strict, u64);
    data_getters!(get_i8, get_i8_strict, i8);
    data_getters!(get_i16, get_i16_strict, i16);
    data_getters!(get_i32, get_i32_strict, i32);
    data_getters!(get_i64, get_i64_strict, i64);

    pub fn get_f32(&self, byte_offset: u32) -> f32 {
        f32::from_bits(self.get_u32(byte_offset))
    }

    pub fn get_f64(&self, byte_offset: u32) -> f64 {
        f64::from_bits(self.get_u64(byte_offset))
    }

    /// Reads the bit at `bit_offset` from the start of the data section.
    pub fn get_bool(&self, bit_offset: u32) -> bool {
        match self.data.get(bit_offset as usize / 8) {
            Some(byte) => byte & (1 << (bit_offset % 8)) != 0,
            None => false,
        }
    }

    pub fn get_bool_strict(&self, bit_offset: u32) -> Result<bool> {
        match self.data.get(bit_offset as usize / 8) {
            Some(byte) => Ok(byte & (1 << (bit_offset % 8)) != 0),
            None => Err(Error::out_of_bounds(
                "read past the end of a struct's data section",
            )),
        }
    }

    /// Union discriminants are plain u16 fields.
    pub fn get_union_discriminant(&self, byte_offset: u32) -> u16 {
        self.get_u16(byte_offset)
    }

    /// The pointer slot at `index`. Indices past the pointer section
    /// behave as null pointers (schema evolution).
    pub fn get_pointer(&self, index: u16) -> PointerReader<'a> {
        if index < self.ptr_words {
            PointerReader::new(
                self.ctx,
                self.segment,
                self.ptr_start + index as u32,
                self.nesting,
            )
        } else {
            PointerReader::absent(self.ctx, self.nesting)
        }
    }

    pub fn get_struct(&self, index: u16) -> Result<StructReader<'a>> {
        self.get_pointer(index).get_struct()
    }

    pub fn get_list(&self, index: u16, expected: Option<ElementSize>) -> Result<ListReader<'a>> {
        self.get_pointer(index).get_list(expected)
    }

    pub fn get_text(&self, index: u16) -> Result<text::Reader<'a>> {
        self.get_pointer(index).get_text()
    }

    pub fn get_data(&self, index: u16) -> Result<&'a [u8]> {
        self.get_pointer(index).get_data()
    }

    pub fn get_capability(&self, index: u16) -> Result<u32> {
        self.get_pointer(index).get_capability()
    }

    pub fn get_primitive_list<T: crate::primitive_list::PrimitiveElement>(
        &self,
        index: u16,
    ) -> Result<crate::primitive_list::Reader<'a, T>> {
        Ok(crate::primitive_list::Reader::new(
            self.get_pointer(index).get_list(Some(T::ELEMENT_SIZE))?,
        ))
    }

    pub fn get_struct_list(&self, index: u16) -> Result<crate::struct_list::Reader<'a>> {
        Ok(crate::struct_list::Reader::new(
            self.get_pointer(index)
                .get_list(Some(ElementSize::InlineComposite))?,
        ))
    }

    pub fn get_pointer_list(&self, index: u16) -> Result<crate::pointer_list::Reader<'a>> {
        Ok(crate::pointer_list::Reader::new(
            self.get_pointer(index).get_list(Some(ElementSize::Pointer))?,
        ))
    }

    /// The pointer slot at `index` as an untyped pointer.
    pub fn get_any(&self, index: u16) -> crate::any_pointer::Reader<'a> {
        crate::any_pointer::Reader::new(self.get_pointer(index))
    }
}

/// A zero-copy view of one list.
#[derive(Clone, Copy, Debug)]
pub struct ListReader<'a> {
    ctx: ReadCtx<'a>,
    segment: u32,
    seg_bytes: &'a [u8],
    /// Word index of the first element (for inline composite, the word
    /// after the tag).
    start: u32,
    count: u32,
    elem: ElementSize,
    step_bits: u32,
    data_words: u16,
    ptr_words: u16,
    nesting: i32,
}

impl<'a> ListReader<'a> {
    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn element_size(&self) -> ElementSize {
        self.elem
    }

    /// The per-element struct section sizes of an inline-composite list.
    pub fn struct_sizes(&self) -> (u16, u16) {
        (self.data_words, self.ptr_words)
    }

    /// The raw bytes spanned by the elements of a data-bearing list.
    /// The span was bounds-checked when the reader was constructed.
    pub fn raw_bytes(&self) -> &'a [u8] {
        let start = self.start as usize * BYTES_PER_WORD;
        let len = (self.count as u64 * self.step_bits as u64).div_ceil(8) as usize;
        &self.seg_bytes[start..start + len]
    }

    /// Reads a primitive element as raw little-endian bytes of width
    /// `size` at `index`. Panics if `index >= len()`; width mismatches
    /// were rejected when the reader was constructed.
    pub(crate) fn primitive_bytes(&self, index: u32, size: usize) -> &'a [u8] {
        assert!(index < self.count);
        let off = self.start as usize * BYTES_PER_WORD + index as usize * size;
        &self.seg_bytes[off..off + size]
    }

    pub(crate) fn get_bool_element(&self, index: u32) -> bool {
        assert!(index < self.count);
        let bit = self.start as usize * 64 + index as usize;
        self.seg_bytes[bit / 8] & (1 << (bit % 8)) != 0
    }

    /// The struct element at `index` of an inline-composite list.
    pub fn get_struct_element(&self, index: u32) -> Result<StructReader<'a>> {
        if self.elem != ElementSize::InlineComposite {
            return Err(Error::invalid_pointer(
                "list elements are not inline-composite structs",
            ));
        }
        if index >= self.count {
            return Err(Error::out_of_bounds("struct list index out of range"));
        }
        if self.nesting <= 0 {
            return Err(Error::nesting_limit_exceeded(
                "message is too deeply nested; see ReaderOptions::nesting_limit",
            ));
        }
        let per_element = self.data_words as u32 + self.ptr_words as u32;
        StructReader::new(
            self.ctx,
            self.segment,
            self.start + index * per_element,
            self.data_words,
            self.ptr_words,
            self.nesting - 1,
        )
    }

    /// The pointer element at `index` of a pointer list.
    pub fn get_pointer_element(&self, index: u32) -> Result<PointerReader<'a>> {
        if self.elem != ElementSize::Pointer {
            return Err(Error::invalid_pointer("list elements are not pointers"));
        }
        if index >= self.count {
            return Err(Error::out_of_bounds("pointer list index out of range"));
        }
        Ok(PointerReader::new(
            self.ctx,
            self.segment,
            self.start + index,
            self.nesting,
        ))
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Where a pointer's content landed: in the pointer's own segment, or in
/// another segment behind a landing pad.
enum Spot {
    Same { content: u32 },
    Far { segment: u32, pad: u32, content: u32 },
}

fn reserve(arena: &mut BuildArena, from_segment: u32, words: u32, pad_words: u32) -> Spot {
    if let Some(content) = arena.allocate_in(from_segment, words) {
        return Spot::Same { content };
    }
    let (segment, pad) = arena.allocate(words + pad_words);
    Spot::Far {
        segment,
        pad,
        content: pad + pad_words,
    }
}

/// A builder positioned on one pointer slot.
pub struct PointerBuilder<'a> {
    arena: &'a mut BuildArena,
    segment: u32,
    word: u32,
}

impl<'a> PointerBuilder<'a> {
    pub(crate) fn new(arena: &'a mut BuildArena, segment: u32, word: u32) -> Self {
        Self {
            arena,
            segment,
            word,
        }
    }

    pub fn reborrow(&mut self) -> PointerBuilder<'_> {
        PointerBuilder {
            arena: &mut *self.arena,
            segment: self.segment,
            word: self.word,
        }
    }

    pub fn is_null(&self) -> bool {
        self.arena.read_word(self.segment, self.word) == 0
    }

    /// Writes a null pointer. Any previous content becomes unreferenced.
    pub fn clear(&mut self) {
        self.arena.write_word(self.segment, self.word, 0);
    }

    fn write_object_pointer(&mut self, spot: &Spot, make: impl Fn(i32) -> WirePointer) {
        match spot {
            Spot::Same { content } => {
                let offset = *content as i64 - (self.word as i64 + 1);
                self.arena
                    .write_word(self.segment, self.word, make(offset as i32).0);
            }
            Spot::Far {
                segment,
                pad,
                content,
            } => {
                // Single-far landing pad: the pad holds the real pointer,
                // with the content allocated immediately after it.
                let offset = *content as i64 - (*pad as i64 + 1);
                self.arena.write_word(*segment, *pad, make(offset as i32).0);
                self.arena.write_word(
                    self.segment,
                    self.word,
                    WirePointer::new_far(false, *pad, *segment).0,
                );
            }
        }
    }

    pub fn init_struct(self, data_words: u16, ptr_words: u16) -> StructBuilder<'a> {
        let total = data_words as u32 + ptr_words as u32;
        let mut this = self;
        let spot = reserve(this.arena, this.segment, total, 1);
        this.write_object_pointer(&spot, |offset| {
            WirePointer::new_struct(offset, data_words, ptr_words)
        });
        let (segment, data) = match spot {
            Spot::Same { content } => (this.segment, content),
            Spot::Far {
                segment, content, ..
            } => (segment, content),
        };
        StructBuilder {
            arena: this.arena,
            segment,
            data,
            data_words,
            ptr_words,
        }
    }

    pub fn init_list(self, elem: ElementSize, count: u32) -> Result<ListBuilder<'a>> {
        if elem == ElementSize::InlineComposite {
            return Err(Error::invalid_pointer(
                "init_struct_list must be used for inline-composite lists",
            ));
        }
        if count > MAX_LIST_ELEMENTS {
            return Err(Error::list_too_large(format!(
                "list of {count} elements exceeds the wire format's limit"
            )));
        }
        let step = elem.step_bits();
        let words = (count as u64 * step as u64).div_ceil(64) as u32;
        let spot = reserve(self.arena, self.segment, words, 1);
        let mut this = self;
        this.write_object_pointer(&spot, |offset| WirePointer::new_list(offset, elem, count));
        let (content_segment, content) = match spot {
            Spot::Same { content } => (this.segment, content),
            Spot::Far {
                segment, content, ..
            } => (segment, content),
        };
        Ok(ListBuilder {
            arena: this.arena,
            segment: content_segment,
            start: content,
            count,
            elem,
            step_bits: step,
            data_words: 0,
            ptr_words: 0,
        })
    }

    /// Initializes an inline-composite list of `count` structs, each with
    /// the given section sizes. When the list lands in a different segment
    /// than the pointer, a double-far landing pad is emitted whose second
    /// word carries the list pointer.
    pub fn init_struct_list(
        self,
        count: u32,
        data_words: u16,
        ptr_words: u16,
    ) -> Result<ListBuilder<'a>> {
        let per_element = data_words as u32 + ptr_words as u32;
        let element_words = (count as u64) * (per_element as u64);
        if count > MAX_LIST_ELEMENTS || element_words > MAX_LIST_ELEMENTS as u64 {
            return Err(Error::list_too_large(format!(
                "struct list of {count} elements exceeds the wire format's limit"
            )));
        }
        let element_words = element_words as u32;
        let total = 1 + element_words; // tag + elements
        let tag = WirePointer::new_composite_tag(count, data_words, ptr_words);
        let this = self;
        let (arena, segment, word) = (this.arena, this.segment, this.word);
        match reserve(arena, segment, total, 2) {
            Spot::Same { content } => {
                arena.write_word(segment, content, tag.0);
                let offset = content as i64 - (word as i64 + 1);
                arena.write_word(
                    segment,
                    word,
                    WirePointer::new_list(
                        offset as i32,
                        ElementSize::InlineComposite,
                        element_words,
                    )
                    .0,
                );
                Ok(ListBuilder {
                    arena,
                    segment,
                    start: content + 1,
                    count,
                    elem: ElementSize::InlineComposite,
                    step_bits: per_element * 64,
                    data_words,
                    ptr_words,
                })
            }
            Spot::Far {
                segment: far_seg,
                pad,
                content,
            } => {
                // Double-far: pad word 0 points at the tag word, pad word 1
                // is the list pointer with a zero offset.
                arena.write_word(far_seg, pad, WirePointer::new_far(false, content, far_seg).0);
                arena.write_word(
                    far_seg,
                    pad + 1,
                    WirePointer::new_list(0, ElementSize::InlineComposite, element_words).0,
                );
                arena.write_word(far_seg, content, tag.0);
                arena.write_word(segment, word, WirePointer::new_far(true, pad, far_seg).0);
                Ok(ListBuilder {
                    arena,
                    segment: far_seg,
                    start: content + 1,
                    count,
                    elem: ElementSize::InlineComposite,
                    step_bits: per_element * 64,
                    data_words,
                    ptr_words,
                })
            }
        }
    }

    /// Writes `value` as a NUL-terminated text list.
    pub fn set_text(self, value: &str) -> Result<()> {
        self.set_byte_list(value.as_bytes(), true)
    }

    pub fn set_data(self, value: &[u8]) -> Result<()> {
        self.set_byte_list(value, false)
    }

    fn set_byte_list(self, bytes: &[u8], terminate: bool) -> Result<()> {
        let count = bytes.len() as u64 + terminate as u64;
        if count > MAX_LIST_ELEMENTS as u64 {
            return Err(Error::list_too_large("byte list exceeds the wire format's limit"));
        }
        let count = count as u32;
        let words = (count as u64).div_ceil(8) as u32;
        let spot = reserve(self.arena, self.segment, words, 1);
        let mut this = self;
        this.write_object_pointer(&spot, |offset| {
            WirePointer::new_list(offset, ElementSize::Byte, count)
        });
        let (content_segment, content) = match spot {
            Spot::Same { content } => (this.segment, content),
            Spot::Far {
                segment, content, ..
            } => (segment, content),
        };
        this.arena
            .write_bytes(content_segment, content as usize * BYTES_PER_WORD, bytes);
        // The terminator and alignment padding are already zero.
        Ok(())
    }

    pub fn set_capability(&mut self, index: u32) {
        self.arena
            .write_word(self.segment, self.word, WirePointer::new_capability(index).0);
    }
}

/// Writes one struct's data and pointer sections.
pub struct StructBuilder<'a> {
    arena: &'a mut BuildArena,
    segment: u32,
    /// Word index of the data section.
    data: u32,
    data_words: u16,
    ptr_words: u16,
}

macro_rules! data_setters {
    ($set:ident, $set_strict:ident, $t:ty) => {
        /// Writes the value at `byte_offset` in the data section; writes
        /// past the end are silent no-ops.
        pub fn $set(&mut self, byte_offset: u32, value: $t) {
            let _ = self.$set_strict(byte_offset, value);
        }

        /// Like the non-strict setter, but signals `OutOfBounds` instead
        /// of ignoring the write.
        pub fn $set_strict(&mut self, byte_offset: u32, value: $t) -> Result<()> {
            let size = core::mem::size_of::<$t>();
            if byte_offset as usize + size > self.data_words as usize * BYTES_PER_WORD {
                return Err(Error::out_of_bounds(
                    "write past the end of a struct's data section",
                ));
            }
            self.arena.write_bytes(
                self.segment,
                self.data as usize * BYTES_PER_WORD + byte_offset as usize,
                &value.to_le_bytes(),
            );
            Ok(())
        }
    };
}

impl<'a> StructBuilder<'a> {
    pub(crate) fn from_parts(
        arena: &'a mut BuildArena,
        segment: u32,
        data: u32,
        data_words: u16,
        ptr_words: u16,
    ) -> Self {
        Self {
            arena,
            segment,
            data,
            data_words,
            ptr_words,
        }
    }

    pub fn data_words(&self) -> u16 {
        self.data_words
    }

    pub fn ptr_words(&self) -> u16 {
        self.ptr_words
    }

    pub fn reborrow(&mut self) -> StructBuilder<'_> {
        StructBuilder {
            arena: &mut *self.arena,
            segment: self.segment,
            data: self.data,
            data_words: self.data_words,
            ptr_words: self.ptr_words,
        }
    }

    data_setters!(set_u8, set_u8_strict, u8);
    data_setters!(set_u16, set_u16_strict, u16);
    data_setters!(set_u32, set_u32_strict, u32);
    data_setters!(set_u64, set_u64_strict, u64);
    data_setters!(set_i8, set_i8_strict, i8);
    data_setters!(set_i16, set_i16_strict, i16);
    data_setters!(set_i32, set_i32_strict, i32);
    data_setters!(set_i64, set_i64_strict, i64);

    pub fn set_f32(&mut self, byte_offset: u32, value: f32) {
        self.set_u32(byte_offset, value.to_bits());
    }

    pub fn set_f64(&mut self, byte_offset: u32, value: f64) {
        self.set_u64(byte_offset, value.to_bits());
    }

    pub fn set_bool(&mut self, bit_offset: u32, value: bool) {
        let _ = self.set_bool_strict(bit_offset, value);
    }

    pub fn set_bool_strict(&mut self, bit_offset: u32, value: bool) -> Result<()> {
        let byte = bit_offset as usize / 8;
        if byte >= self.data_words as usize * BYTES_PER_WORD {
            return Err(Error::out_of_bounds(
                "write past the end of a struct's data section",
            ));
        }
        let abs = self.data as usize * BYTES_PER_WORD + byte;
        let mut b = self.arena.read_bytes(self.segment, abs, 1)[0];
        if value {
            b |= 1 << (bit_offset % 8);
        } else {
            b &= !(1 << (bit_offset % 8));
        }
        self.arena.write_bytes(self.segment, abs, &[b]);
        Ok(())
    }

    pub fn set_union_discriminant(&mut self, byte_offset: u32, value: u16) {
        self.set_u16(byte_offset, value);
    }

    /// The pointer slot at `index`. Unlike data writes, pointer writes
    /// past the section are hard errors.
    pub fn get_pointer(&mut self, index: u16) -> Result<PointerBuilder<'_>> {
        if index >= self.ptr_words {
            return Err(Error::out_of_bounds(
                "pointer index past the end of a struct's pointer section",
            ));
        }
        Ok(PointerBuilder::new(
            &mut *self.arena,
            self.segment,
            self.data + self.data_words as u32 + index as u32,
        ))
    }

    /// Like `get_pointer`, but consumes the builder so the slot keeps the
    /// builder's full lifetime.
    pub fn into_pointer(self, index: u16) -> Result<PointerBuilder<'a>> {
        if index >= self.ptr_words {
            return Err(Error::out_of_bounds(
                "pointer index past the end of a struct's pointer section",
            ));
        }
        Ok(PointerBuilder::new(
            self.arena,
            self.segment,
            self.data + self.data_words as u32 + index as u32,
        ))
    }

    pub fn init_struct(&mut self, index: u16, data_words: u16, ptr_words: u16) -> Result<StructBuilder<'_>> {
        Ok(self.get_pointer(index)?.init_struct(data_words, ptr_words))
    }

    pub fn init_list(&mut self, index: u16, elem: ElementSize, count: u32) -> Result<ListBuilder<'_>> {
        self.get_pointer(index)?.init_list(elem, count)
    }

    pub fn init_struct_list(
        &mut self,
        index: u16,
        count: u32,
        data_words: u16,
        ptr_words: u16,
    ) -> Result<ListBuilder<'_>> {
        self.get_pointer(index)?
            .init_struct_list(count, data_words, ptr_words)
    }

    pub fn set_text(&mut self, index: u16, value: &str) -> Result<()> {
        self.get_pointer(index)?.set_text(value)
    }

    pub fn set_data(&mut self, index: u16, value: &[u8]) -> Result<()> {
        self.get_pointer(index)?.set_data(value)
    }

    pub fn set_capability(&mut self, index: u16, cap: u32) -> Result<()> {
        self.get_pointer(index)?.set_capability(cap);
        Ok(())
    }

    pub fn init_primitive_list<T: crate::primitive_list::PrimitiveElement>(
        &mut self,
        index: u16,
        count: u32,
    ) -> Result<crate::primitive_list::Builder<'_, T>> {
        Ok(crate::primitive_list::Builder::new(
            self.get_pointer(index)?.init_list(T::ELEMENT_SIZE, count)?,
        ))
    }

    pub fn init_pointer_list(&mut self, index: u16, count: u32) -> Result<crate::pointer_list::Builder<'_>> {
        Ok(crate::pointer_list::Builder::new(
            self.get_pointer(index)?.init_list(ElementSize::Pointer, count)?,
        ))
    }

    /// The pointer slot at `index` as an untyped pointer builder.
    pub fn get_any(&mut self, index: u16) -> Result<crate::any_pointer::Builder<'_>> {
        Ok(crate::any_pointer::Builder::new(self.get_pointer(index)?))
    }

    pub(crate) fn data_byte_range(&self) -> (u32, usize, usize) {
        (
            self.segment,
            self.data as usize * BYTES_PER_WORD,
            self.data_words as usize * BYTES_PER_WORD,
        )
    }

    pub(crate) fn arena_mut(&mut self) -> &mut BuildArena {
        self.arena
    }
}

/// Writes one list's elements.
pub struct ListBuilder<'a> {
    arena: &'a mut BuildArena,
    segment: u32,
    start: u32,
    count: u32,
    elem: ElementSize,
    step_bits: u32,
    data_words: u16,
    ptr_words: u16,
}

impl<'a> ListBuilder<'a> {
    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn element_size(&self) -> ElementSize {
        self.elem
    }

    pub fn reborrow(&mut self) -> ListBuilder<'_> {
        ListBuilder {
            arena: &mut *self.arena,
            segment: self.segment,
            start: self.start,
            count: self.count,
            elem: self.elem,
            step_bits: self.step_bits,
            data_words: self.data_words,
            ptr_words: self.ptr_words,
        }
    }

    /// Writes a primitive element as raw little-endian bytes. Panics if
    /// `index >= len()`.
    pub(crate) fn set_primitive_bytes(&mut self, index: u32, bytes: &[u8]) {
        assert!(index < self.count);
        let off = self.start as usize * BYTES_PER_WORD + index as usize * bytes.len();
        self.arena.write_bytes(self.segment, off, bytes);
    }

    pub(crate) fn set_bool_element(&mut self, index: u32, value: bool) {
        assert!(index < self.count);
        let bit = self.start as usize * 64 + index as usize;
        let mut byte = self.arena.read_bytes(self.segment, bit / 8, 1)[0];
        if value {
            byte |= 1 << (bit % 8);
        } else {
            byte &= !(1 << (bit % 8));
        }
        self.arena.write_bytes(self.segment, bit / 8, &[byte]);
    }

    /// Bulk-writes the raw bytes backing the elements, used by deep copy.
    pub(crate) fn copy_raw_bytes(&mut self, bytes: &[u8]) {
        let len = (self.count as u64 * self.step_bits as u64).div_ceil(8) as usize;
        debug_assert_eq!(len, bytes.len());
        self.arena
            .write_bytes(self.segment, self.start as usize * BYTES_PER_WORD, bytes);
    }

    pub fn get_struct_element(&mut self, index: u32) -> Result<StructBuilder<'_>> {
        if self.elem != ElementSize::InlineComposite {
            return Err(Error::invalid_pointer(
                "list elements are not inline-composite structs",
            ));
        }
        if index >= self.count {
            return Err(Error::out_of_bounds("struct list index out of range"));
        }
        let per_element = self.data_words as u32 + self.ptr_words as u32;
        Ok(StructBuilder {
            arena: &mut *self.arena,
            segment: self.segment,
            data: self.start + index * per_element,
            data_words: self.data_words,
            ptr_words: self.ptr_words,
        })
    }

    pub fn get_pointer_element(&mut self, index: u32) -> Result<PointerBuilder<'_>> {
        if self.elem != ElementSize::Pointer {
            return Err(Error::invalid_pointer("list elements are not pointers"));
        }
        if index >= self.count {
            return Err(Error::out_of_bounds("pointer list index out of range"));
        }
        Ok(PointerBuilder::new(
            &mut *self.arena,
            self.segment,
            self.start + index,
        ))
    }
}
