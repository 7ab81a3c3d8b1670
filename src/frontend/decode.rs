//! Decode lowering.
//!
//! A struct decodes as a loop over wire fields. The field id selects an arm
//! through a jump table when the ids are dense, a compare chain otherwise.
//! Unknown ids and tag mismatches are skipped. Frame slot 0 holds the struct
//! base and slots 1.. a bitmask of the fields seen so far.

use std::sync::Arc;

use crate::error::{CompileError, ErrorCode};
use crate::ir::{Cond, Label, Reg, Width};
use crate::runtime;
use crate::schema::{Field, Kind, Requiredness, TypeDescriptor};

use super::{Lowering, MAX_TRACKED_FIELDS, SEEN_BITS_PER_SLOT, header_tag, is_simple, seen_bit};

/// Smallest field count worth a jump table.
const SWITCH_MIN_FIELDS: usize = 4;

fn scalar_width(ty: &TypeDescriptor) -> Result<Width, CompileError> {
    Width::from_bytes(ty.size)
        .ok_or_else(|| CompileError::Unsupported(format!("{} has no scalar width", ty.name)))
}

/// Whether the ids `min..=max` of `n` fields are dense enough for a table.
fn is_dense(n: usize, min: i64, max: i64) -> bool {
    n >= SWITCH_MIN_FIELDS && (max - min) as usize <= 4 * n + 8
}

impl Lowering<'_> {
    /// Decodes a struct into the zeroed-on-entry memory at `p0`.
    pub(super) fn dec_struct(&mut self, ty: &Arc<TypeDescriptor>) -> Result<(), CompileError> {
        let n = ty.fields.len();
        if n > MAX_TRACKED_FIELDS {
            return Err(CompileError::Unsupported(format!(
                "{} has {n} fields, at most {MAX_TRACKED_FIELDS} are supported",
                ty.name
            )));
        }
        let slots = n.div_ceil(SEEN_BITS_PER_SLOT);

        self.b.zero(Reg::P0, 0, ty.size);
        for field in &ty.fields {
            if let Some(default) = field.default {
                let bits = default.raw_bits();
                if bits != 0 {
                    self.b.mov_imm(Reg::R0, bits);
                    self.b.store(scalar_width(&field.ty)?, Reg::R0, Reg::P0, field.offset);
                }
            }
        }

        self.b.enter();
        self.b.store_frame(Reg::P0, 0);
        if slots > 0 {
            self.b.mov_imm(Reg::R0, 0);
            for slot in 1..=slots {
                self.b.store_frame(Reg::R0, slot as u8);
            }
        }

        let top = self.b.label();
        let end = self.b.label();
        let unknown = self.b.label();

        self.b.bind(top);
        self.b.load_frame(Reg::P0, 0);
        self.b.check(1);
        self.b.read_int(Width::W1, false, Reg::R0);
        self.b.branch_imm(Cond::Eq, Reg::R0, 0, end);
        self.b.check(2);
        self.b.read_int(Width::W2, true, Reg::R1);

        let arms: Vec<Label> = ty.fields.iter().map(|_| self.b.label()).collect();
        self.dispatch(ty, &arms, unknown);

        self.b.bind(unknown);
        self.b.call(runtime::SKIP, &[Reg::R0], &[]);
        self.b.jump(top);

        for (index, (field, arm)) in ty.fields.iter().zip(&arms).enumerate() {
            self.b.bind(*arm);
            self.b.branch_imm(Cond::Ne, Reg::R0, header_tag(field) as i32, unknown);

            let (slot, mask) = seen_bit(index);
            let duplicate = self.exit(ErrorCode::DuplicateField);
            self.b.load_frame(Reg::R2, slot);
            self.b.and_imm(Reg::R3, Reg::R2, mask);
            self.b.branch_imm(Cond::Ne, Reg::R3, 0, duplicate);
            self.b.or_imm(Reg::R2, Reg::R2, mask);
            self.b.store_frame(Reg::R2, slot);

            self.dec_field(field)?;
            self.b.jump(top);
        }

        self.b.bind(end);
        let mut required = vec![0i32; slots];
        for (index, field) in ty.fields.iter().enumerate() {
            if field.requiredness == Requiredness::Required {
                let (slot, mask) = seen_bit(index);
                required[slot as usize - 1] |= mask;
            }
        }
        for (i, mask) in required.into_iter().enumerate() {
            if mask == 0 {
                continue;
            }
            let missing = self.exit(ErrorCode::MissingRequiredField);
            self.b.load_frame(Reg::R2, i as u8 + 1);
            self.b.and_imm(Reg::R3, Reg::R2, mask);
            self.b.branch_imm(Cond::Ne, Reg::R3, mask, missing);
        }
        self.b.leave();
        Ok(())
    }

    /// Jumps to `arms[i]` for the field whose id is in `r1`, else to `unknown`.
    fn dispatch(&mut self, ty: &TypeDescriptor, arms: &[Label], unknown: Label) {
        let ids = ty.fields.iter().map(|f| f.id as i64);
        let (Some(min), Some(max)) = (ids.clone().min(), ids.max()) else {
            self.b.jump(unknown);
            return;
        };

        if is_dense(arms.len(), min, max) {
            let mut table = vec![unknown; (max - min + 1) as usize];
            for (field, arm) in ty.fields.iter().zip(arms) {
                table[(field.id as i64 - min) as usize] = *arm;
            }
            self.b.add_imm(Reg::R4, Reg::R1, -(min as i32));
            self.b.switch(Reg::R4, &table, unknown);
        } else {
            for (field, arm) in ty.fields.iter().zip(arms) {
                self.b.branch_imm(Cond::Eq, Reg::R1, field.id as i32, *arm);
            }
            self.b.jump(unknown);
        }
    }

    fn dec_field(&mut self, field: &Field) -> Result<(), CompileError> {
        let ty = &field.ty;
        let off = field.offset;
        if field.is_boxed() {
            let width = scalar_width(ty)?;
            self.alloc_const(Reg::P1, crate::schema::BOX_CELL_SIZE);
            self.b.store_ptr(Reg::P1, Reg::P0, off);
            self.b.check(width.bytes());
            self.b.read_int(width, false, Reg::R0);
            self.b.store(width, Reg::R0, Reg::P1, 0);
            return Ok(());
        }
        self.dec_value(ty, Reg::P0, off, false)
    }

    fn alloc_const(&mut self, dst: Reg, size: u32) {
        self.b.mov_imm(Reg::R2, size as u64);
        self.b.call(runtime::ALLOC, &[Reg::R2], &[dst]);
    }

    /// Decodes a value of type `ty` into `base + off`. With `prechecked`, the
    /// input bounds of a fixed-size value have already been verified.
    fn dec_value(&mut self, ty: &Arc<TypeDescriptor>, base: Reg, off: u32, prechecked: bool) -> Result<(), CompileError> {
        match ty.kind {
            k if k.is_scalar() => {
                let width = scalar_width(ty)?;
                if !prechecked {
                    self.b.check(width.bytes());
                }
                self.b.read_int(width, false, Reg::R0);
                self.b.store(width, Reg::R0, base, off);
                Ok(())
            }
            Kind::String | Kind::Binary => {
                self.dec_blob(base, off);
                Ok(())
            }
            Kind::List | Kind::Set | Kind::Map => self.dec_container(ty, base, off),
            Kind::Struct => {
                if base != Reg::P0 || off != 0 {
                    self.b.seek(Reg::P0, base, off as i32);
                }
                self.nested_struct(ty, |lw, t| lw.dec_struct(t))
            }
            _ => {
                let target = TypeDescriptor::struct_type(ty)?;
                self.alloc_const(Reg::P2, target.size);
                self.b.store_ptr(Reg::P2, base, off);
                self.b.seek(Reg::P0, Reg::P2, 0);
                self.nested_struct(ty, |lw, t| lw.dec_struct(t))
            }
        }
    }

    /// String or binary: a signed 32-bit length, then the bytes.
    fn dec_blob(&mut self, base: Reg, off: u32) {
        let invalid = self.exit(ErrorCode::InvalidLength);
        self.b.check(4);
        self.b.read_int(Width::W4, true, Reg::R2);
        self.b.branch_imm(Cond::Lt, Reg::R2, 0, invalid);
        self.b.check_reg(Reg::R2);
        self.b.call(runtime::ALLOC, &[Reg::R2], &[Reg::P2]);
        self.b.store_ptr(Reg::P2, base, off);
        self.b.store(Width::W4, Reg::R2, base, off + 4);
        self.b.read_bytes(Reg::P2, Reg::R2);
    }

    fn dec_container(&mut self, ty: &Arc<TypeDescriptor>, base: Reg, off: u32) -> Result<(), CompileError> {
        let is_map = ty.kind == Kind::Map;
        let is_set = ty.kind == Kind::Set;
        let val = ty.elem()?.clone();
        let key = if is_map { Some(ty.map_key()?.clone()) } else { None };
        let (val_off, stride) = if is_map {
            ty.map_entry_layout()?
        } else {
            (0, ty.elem_stride()?)
        };
        let invalid_length = self.exit(ErrorCode::InvalidLength);
        let invalid_tag = self.exit(ErrorCode::InvalidTag);

        // Header: [key tag] value tag, signed count.
        self.b.check(if is_map { 6 } else { 5 });
        if is_map {
            self.b.read_int(Width::W1, false, Reg::R2);
        }
        self.b.read_int(Width::W1, false, Reg::R3);
        self.b.read_int(Width::W4, true, Reg::R1);
        self.b.branch_imm(Cond::Lt, Reg::R1, 0, invalid_length);

        // Element tags only matter when there are elements.
        let tags_ok = self.b.label();
        self.b.branch_imm(Cond::Eq, Reg::R1, 0, tags_ok);
        self.b.branch_imm(Cond::Ne, Reg::R3, crate::wire::tag_of(val.kind) as i32, invalid_tag);
        if let Some(key) = &key {
            self.b.branch_imm(Cond::Ne, Reg::R2, crate::wire::tag_of(key.kind) as i32, invalid_tag);
        }
        self.b.bind(tags_ok);

        let min_entry = val.min_wire_size() + key.as_ref().map_or(0, |k| k.min_wire_size());
        self.b.mul_imm(Reg::R2, Reg::R1, min_entry as i32);
        self.b.check_reg(Reg::R2);

        self.b.mul_imm(Reg::R2, Reg::R1, stride as i32);
        self.b.call(runtime::ALLOC, &[Reg::R2], &[Reg::P1]);
        self.b.store_ptr(Reg::P1, base, off);
        self.b.store(Width::W4, Reg::R1, base, off + 4);

        let done = self.b.label();
        self.b.branch_imm(Cond::Eq, Reg::R1, 0, done);

        // The count check above already covers fixed-size entries.
        let fixed = match &key {
            Some(k) => k.fixed_wire_size().is_some() && val.fixed_wire_size().is_some(),
            None => val.fixed_wire_size().is_some(),
        };
        let simple = is_simple(&val) && key.as_deref().is_none_or(is_simple);
        let lp = self.b.label();
        if simple {
            if is_set {
                self.b.seek(Reg::P3, Reg::P1, 0);
                self.b.mov(Reg::R3, Reg::R1);
            }
            self.b.bind(lp);
            self.dec_entry(key.as_ref(), &val, val_off, fixed)?;
            self.b.seek(Reg::P1, Reg::P1, stride as i32);
            self.b.add_imm(Reg::R1, Reg::R1, -1);
            self.b.branch_imm(Cond::Ne, Reg::R1, 0, lp);
        } else {
            self.b.enter();
            self.b.store_frame(Reg::P1, 0);
            self.b.store_frame(Reg::R1, 1);
            if is_set {
                self.b.store_frame(Reg::P1, 2);
                self.b.store_frame(Reg::R1, 3);
            }
            self.b.bind(lp);
            self.dec_entry(key.as_ref(), &val, val_off, false)?;
            self.b.load_frame(Reg::P1, 0);
            self.b.load_frame(Reg::R1, 1);
            self.b.seek(Reg::P1, Reg::P1, stride as i32);
            self.b.add_imm(Reg::R1, Reg::R1, -1);
            self.b.store_frame(Reg::P1, 0);
            self.b.store_frame(Reg::R1, 1);
            self.b.branch_imm(Cond::Ne, Reg::R1, 0, lp);
            if is_set {
                self.b.load_frame(Reg::P3, 2);
                self.b.load_frame(Reg::R3, 3);
            }
            self.b.leave();
        }

        if is_set {
            let index = self.type_index(&val);
            self.b.mov_imm(Reg::R2, index as u64);
            self.b.call(runtime::SET_CHECK, &[Reg::R2, Reg::P3, Reg::R3], &[]);
        }
        self.b.bind(done);
        Ok(())
    }

    /// One list element or map entry into the memory at `p1`.
    fn dec_entry(
        &mut self,
        key: Option<&Arc<TypeDescriptor>>,
        val: &Arc<TypeDescriptor>,
        val_off: u32,
        prechecked: bool,
    ) -> Result<(), CompileError> {
        if let Some(key) = key {
            self.dec_value(key, Reg::P1, 0, prechecked)?;
            if !is_simple(key) {
                self.b.load_frame(Reg::P1, 0);
            }
        }
        self.dec_value(val, Reg::P1, val_off, prechecked)
    }
}
